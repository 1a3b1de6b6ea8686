//! Single-instance setup: kernel pinning, toolkit prerequisites, the database
//! install from staged media, and the ASM filter driver migration.
//!
//! These run through `ConvergenceOrchestrator::apply` against one instance,
//! so they get the same guard/postcondition/halt treatment as the Data Guard
//! steps.

use std::time::Duration;

use serde::Serialize;

use super::sysdba;
use crate::template::Bindings;
use crate::types::{InstanceError, InstanceNaming, Postcondition, Role, StepDefinition, StepTarget};

pub const TOOLKIT_COMMIT: &str = "6642001f07169aab29ddf2b298109707d63e394f";
pub const UEK_KERNEL: &str = "5.4.17-2136.326.6.el8uek";
pub const REBOOT_PREFIX: &str = "REBOOT_REQUIRED=";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
const ASM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupOptions {
    pub skip_install: bool,
    pub skip_asmfd: bool,
}

/// Disk and media layout of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupLayout {
    pub instance_id: String,
    pub db_name: String,
    pub cdb_diskgroup: String,
    pub extra_diskgroups: Vec<String>,
    pub swlib_bucket: String,
    pub media_version: String,
}

#[derive(Serialize)]
struct AsmDisk {
    blk_device: String,
    name: String,
}

#[derive(Serialize)]
struct AsmDiskgroup {
    diskgroup: String,
    disks: Vec<AsmDisk>,
}

impl SetupLayout {
    pub fn new(
        instance_id: &str,
        extra_diskgroups: &[String],
        swlib_bucket: &str,
        media_version: &str,
    ) -> Result<Self, InstanceError> {
        let naming = InstanceNaming::parse(instance_id)?;
        let mut extras = Vec::with_capacity(extra_diskgroups.len());
        for dg in extra_diskgroups {
            let dg = dg.trim().to_uppercase();
            if dg.is_empty() || !dg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(InstanceError::BadDiskgroup(dg));
            }
            extras.push(dg);
        }
        Ok(SetupLayout {
            instance_id: instance_id.to_string(),
            db_name: naming.db_name(),
            cdb_diskgroup: naming.cdb_diskgroup(),
            extra_diskgroups: extras,
            swlib_bucket: swlib_bucket.to_string(),
            media_version: media_version.to_string(),
        })
    }

    /// CDB diskgroup first, then the extras in the order given.
    pub fn all_diskgroups(&self) -> Vec<String> {
        std::iter::once(self.cdb_diskgroup.clone())
            .chain(self.extra_diskgroups.iter().cloned())
            .collect()
    }

    /// `ASM` disk layout for the toolkit: one disk per diskgroup, attached
    /// under the lowercased diskgroup name.
    pub fn asm_config_json(&self) -> String {
        let groups: Vec<AsmDiskgroup> = self
            .all_diskgroups()
            .into_iter()
            .map(|dg| AsmDiskgroup {
                disks: vec![AsmDisk {
                    blk_device: format!("/dev/disk/by-id/google-{}", dg.to_lowercase()),
                    name: format!("{}V", dg),
                }],
                diskgroup: dg,
            })
            .collect();
        serde_json::to_string_pretty(&groups).unwrap_or_else(|_| "[]".to_string())
    }

    /// Disks attach after boot, u01 and swap, so the ASM disks start at sdd.
    pub fn afd_label_commands(&self) -> String {
        self.all_diskgroups()
            .iter()
            .zip(b'd'..=b'z')
            .map(|(dg, letter)| format!("asmcmd afd_label {} /dev/sd{}1 --migrate", dg, letter as char))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Grid home for the media version; `21` installs to `21.3.0`.
    pub fn grid_home(&self) -> String {
        let version = if self.media_version.contains('.') {
            self.media_version.clone()
        } else {
            format!("{}.3.0", self.media_version)
        };
        format!("/u01/app/{}/grid", version)
    }

    pub fn bindings(&self) -> Bindings {
        let mut b = Bindings::new();
        b.insert("db_name".into(), self.db_name.clone());
        b.insert("cdb_diskgroup".into(), self.cdb_diskgroup.clone());
        b.insert("swlib_bucket".into(), self.swlib_bucket.clone());
        b.insert("media_version".into(), self.media_version.clone());
        b.insert("grid_home".into(), self.grid_home());
        b.insert("toolkit_commit".into(), TOOLKIT_COMMIT.into());
        b.insert("asm_config".into(), self.asm_config_json());
        b.insert("all_diskgroups".into(), self.all_diskgroups().join(" "));
        b.insert("afd_label_commands".into(), self.afd_label_commands());
        b
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Pin the UEK6 kernel the filter driver supports. The step reports whether a
/// reset is needed; the caller resets the instance and waits for it.
pub fn kernel_pipeline() -> Vec<StepDefinition> {
    vec![StepDefinition::new(
        "configure_kernel",
        StepTarget::Both,
        format!(
            r#"TARGET={kernel}.x86_64
if [ "$(uname -r)" = "$TARGET" ]; then
    echo {prefix}no
    exit 0
fi
set -e
sudo yum-config-manager --disable ol8_UEKR7
sudo yum-config-manager --enable ol8_UEKR6
rpm -q kernel-uek-{kernel} >/dev/null 2>&1 || sudo yum -y install kernel-uek-{kernel}
sudo grubby --set-default /boot/vmlinuz-$TARGET
echo {prefix}yes
"#,
            kernel = UEK_KERNEL,
            prefix = REBOOT_PREFIX
        ),
        Postcondition::contains("sudo grubby --default-kernel", UEK_KERNEL),
    )
    .capture("reboot_required", Role::Primary, REBOOT_PREFIX)]
}

// ---------------------------------------------------------------------------
// Install and storage
// ---------------------------------------------------------------------------

pub fn instance_setup_pipeline(opts: &SetupOptions) -> Vec<StepDefinition> {
    let mut steps = vec![prerequisites_step(), config_files_step()];
    if !opts.skip_install {
        steps.push(install_step());
        steps.push(sga_step());
    }
    if !opts.skip_asmfd {
        steps.push(asmfd_step());
        steps.push(asm_diskstring_step());
    }
    steps.push(validate_step());
    steps
}

fn prerequisites_step() -> StepDefinition {
    StepDefinition::new(
        "setup_prerequisites",
        StepTarget::Both,
        r#"set -e
[ -f ~/.ssh/id_rsa ] || ssh-keygen -t rsa -N '' -f ~/.ssh/id_rsa
touch ~/.ssh/authorized_keys
grep -qF "$(cat ~/.ssh/id_rsa.pub)" ~/.ssh/authorized_keys || cat ~/.ssh/id_rsa.pub >> ~/.ssh/authorized_keys
chmod 600 ~/.ssh/authorized_keys
ssh -o StrictHostKeyChecking=no $HOSTNAME true

if ! rpm -q rlwrap >/dev/null 2>&1; then
    wget -q -O /tmp/rlwrap.rpm https://rpmfind.net/linux/epel/8/Everything/x86_64/Packages/r/rlwrap-0.46.2-3.el8.x86_64.rpm
    sudo dnf -y install /tmp/rlwrap.rpm
fi

sudo tee /etc/yum.repos.d/google-cloud-sdk.repo <<'EOF' >/dev/null
[google-cloud-cli]
name=Google Cloud CLI
baseurl=https://packages.cloud.google.com/yum/repos/cloud-sdk-el9-x86_64
enabled=1
gpgcheck=1
repo_gpgcheck=0
gpgkey=https://packages.cloud.google.com/yum/doc/rpm-package-key.gpg
EOF

sudo dnf -y install google-cloud-sdk git bind-utils
python3 -m pip install --user ansible jmespath
[ -d oracle-toolkit ] || git clone https://github.com/google/oracle-toolkit
cd oracle-toolkit
git checkout -q {{toolkit_commit}}
"#,
        Postcondition::equals("cd oracle-toolkit && git rev-parse HEAD", "{{toolkit_commit}}"),
    )
    .retryable()
}

fn config_files_step() -> StepDefinition {
    StepDefinition::new(
        "create_config_files",
        StepTarget::Both,
        r#"set -e
cd oracle-toolkit
cat <<'EOF' > software_mount_config.json
[
    {
        "purpose": "software",
        "blk_device": "/dev/disk/by-id/google-u01",
        "name": "u01",
        "fstype": "xfs",
        "mount_point": "/u01",
        "mount_opts": "nofail"
    }
]
EOF
cat <<'EOF' > asm_config.json
{{asm_config}}
EOF
"#,
        Postcondition::contains(
            "cd oracle-toolkit && test -s software_mount_config.json && grep -q '\"{{cdb_diskgroup}}\"' asm_config.json && echo CONFIG_READY",
            "CONFIG_READY",
        ),
    )
}

fn install_step() -> StepDefinition {
    StepDefinition::new(
        "install_oracle",
        StepTarget::Both,
        r#"if grep -q '^{{db_name}}:' /etc/oratab 2>/dev/null; then
    exit 0
fi
set -e
cd oracle-toolkit
./install-oracle.sh \
  --ora-swlib-type gcs \
  --ora-swlib-bucket {{swlib_bucket}} \
  --backup-dest "+{{cdb_diskgroup}}" \
  --ora-version {{media_version}} \
  --no-patch \
  --ora-data-mounts software_mount_config.json \
  --ora-asm-disks asm_config.json \
  --swap-blk-device "/dev/disk/by-id/google-swap" \
  --ora-data-diskgroup {{cdb_diskgroup}} \
  --ora-reco-diskgroup {{cdb_diskgroup}} \
  --allow-install-on-vm \
  --ora-db-container true \
  --ora-db-name {{db_name}} \
  --ora-pdb-name-prefix PDB0 \
  --instance-hostname {{instance_id}} \
  --instance-ip-addr $(dig +short +search {{instance_id}})
"#,
        Postcondition::contains(
            "grep -q '^{{db_name}}:' /etc/oratab && echo ORACLE_INSTALLED",
            "ORACLE_INSTALLED",
        ),
    )
    .timeout(INSTALL_TIMEOUT)
}

const SGA_QUERY: &str =
    "SELECT 'SGA|' || NVL(VALUE, 'unset') FROM V$SPPARAMETER WHERE NAME = 'sga_target' AND ROWNUM = 1;";

fn sga_step() -> StepDefinition {
    StepDefinition::new(
        "configure_oracle_sga",
        StepTarget::Both,
        format!(
            "SGA_STATE=$({})\ncase \"$SGA_STATE\" in *\"SGA|0\"*) exit 0 ;; esac\n{}",
            sysdba(None, SGA_QUERY),
            sysdba(None, "ALTER SYSTEM SET SGA_TARGET=0 SCOPE=SPFILE;\nSTARTUP FORCE")
        ),
        Postcondition::contains(sysdba(None, SGA_QUERY), "SGA|0"),
    )
}

fn afd_check() -> &'static str {
    r#"sudo su - grid <<'EOF'
export ORACLE_HOME={{grid_home}}
export PATH=$ORACLE_HOME/bin:$PATH
LABELS=$(asmcmd afd_lsdsk 2>/dev/null)
for dg in {{all_diskgroups}}; do
    echo "$LABELS" | grep -q "^$dg " || exit 1
done
echo AFD_READY
EOF
"#
}

fn asmfd_step() -> StepDefinition {
    StepDefinition::new(
        "configure_asmfd",
        StepTarget::Both,
        format!(
            r#"AFD_STATE=$({check})
case "$AFD_STATE" in *AFD_READY*) exit 0 ;; esac
sudo su - <<'EOF'
set -e
export ORACLE_HOME={{{{grid_home}}}}
export PATH=$ORACLE_HOME/bin:$PATH
export ORACLE_BASE=/u01/app
crsctl stop has
asmcmd afd_configure -e
asmcmd afd_state
{{{{afd_label_commands}}}}
asmcmd afd_lsdsk
rm -f /etc/udev/rules.d/99-oracle-asmdevices.rules
udevadm control --reload-rules
udevadm trigger
crsctl start has
EOF
"#,
            check = afd_check()
        ),
        Postcondition::contains(afd_check(), "AFD_READY"),
    )
    .timeout(ASM_TIMEOUT)
}

fn asm_diskstring_step() -> StepDefinition {
    StepDefinition::new(
        "configure_asm_diskstring",
        StepTarget::Both,
        r#"sudo su - grid <<'GRIDEOF'
set -eu
export ORACLE_HOME={{grid_home}}
export ORACLE_BASE=/u01/app
export PATH=$ORACLE_HOME/bin:$PATH

deadline=$(( $(date +%s) + 600 ))
until srvctl status asm 2>&1 | grep -q "is running"; do
    if [ "$(date +%s)" -ge "$deadline" ]; then
        echo "ASM did not start within 600s" >&2
        crsctl stat res -t >&2 || true
        exit 1
    fi
    sleep 10
done

asmcmd dsset 'AFD:*'
sqlplus -S / as sysasm <<'SQLEND'
WHENEVER SQLERROR EXIT FAILURE
ALTER SYSTEM SET ASM_DISKSTRING='AFD:*' SCOPE=BOTH;
SQLEND

for dg in {{all_diskgroups}}; do
    asmcmd lsdg "$dg" 2>/dev/null | grep -q MOUNTED || asmcmd mount "$dg"
done
GRIDEOF

sudo su - oracle <<'ORAEOF'
srvctl status database -d {{db_name}} | grep -q "is running" || srvctl start database -d {{db_name}}
ORAEOF
"#,
        Postcondition::contains(
            "sudo su - grid -c 'export ORACLE_HOME={{grid_home}}; $ORACLE_HOME/bin/asmcmd dsget'",
            "AFD:*",
        ),
    )
    .timeout(ASM_TIMEOUT)
}

fn validate_step() -> StepDefinition {
    StepDefinition::new(
        "validate_setup",
        StepTarget::Both,
        r#"set -e
for dg in {{all_diskgroups}}; do
    sudo su - grid -c "asmcmd lsdg $dg" | grep -q MOUNTED || { echo "diskgroup $dg not mounted" >&2; exit 1; }
done
sudo su - oracle -c "srvctl status database -d {{db_name}}" | grep -q "is running" || { echo "database {{db_name}} not running" >&2; exit 1; }
"#,
        Postcondition::contains(
            sysdba(None, "SELECT 'DB_STATUS:' || STATUS FROM V$INSTANCE;"),
            "DB_STATUS:OPEN",
        ),
    )
}
