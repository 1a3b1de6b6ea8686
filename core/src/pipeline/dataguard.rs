//! The Data Guard step pipeline.
//!
//! Three phases, each optional except the last:
//!
//! 1. network and primary configuration (profiles, TNS, static listener,
//!    Data Guard parameters on the primary, password file)
//! 2. standby creation by RMAN active duplication
//! 3. start redo apply on the standby and enable shipping from the primary
//!
//! Every command is guarded so re-running it against an already-configured
//! pair changes nothing. Each step's postcondition is a read-only query that
//! prints a marker only when the step's effect is in place.

use std::time::Duration;

use super::sysdba;
use crate::types::{Postcondition, Role, StepDefinition, StepTarget};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataGuardOptions {
    /// Skip phase 1; the network and primary are already configured.
    pub skip_primary_config: bool,
    /// Skip phase 2; the standby database already exists.
    pub skip_duplication: bool,
}

pub const ORAPW_MD5_PREFIX: &str = "ORAPW_MD5=";
pub const ORAPW_B64_PREFIX: &str = "ORAPW_B64=";

const DUPLICATION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

pub fn dataguard_pipeline(opts: &DataGuardOptions) -> Vec<StepDefinition> {
    let mut steps = Vec::new();
    if !opts.skip_primary_config {
        steps.extend(primary_config_steps());
    }
    if !opts.skip_duplication {
        steps.extend(duplication_steps());
    }
    steps.extend(replication_steps());
    steps
}

// ---------------------------------------------------------------------------
// Phase 1: network and primary configuration
// ---------------------------------------------------------------------------

fn primary_config_steps() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new(
            "configure_bash_profiles",
            StepTarget::Both,
            r#"ORACLE_HOME=$(sudo su - oracle -c 'echo $ORACLE_HOME')
grep -q '^export ORACLE_HOME=' ~/.bash_profile || echo "export ORACLE_HOME=$ORACLE_HOME" >> ~/.bash_profile
sudo grep -q '^export ORACLE_ORACLE_HOME=' /home/grid/.bash_profile || \
  echo "export ORACLE_ORACLE_HOME=$ORACLE_HOME" | sudo tee -a /home/grid/.bash_profile >/dev/null
"#,
            Postcondition::contains(
                r#"grep -q '^export ORACLE_HOME=' ~/.bash_profile && sudo grep -q '^export ORACLE_ORACLE_HOME=' /home/grid/.bash_profile && echo PROFILES_READY"#,
                "PROFILES_READY",
            ),
        ),
        StepDefinition::new(
            "configure_tns_entries",
            StepTarget::Both,
            r#"for user in oracle grid; do
sudo su - $user <<'EOF'
TNS_FILE="$ORACLE_HOME/network/admin/tnsnames.ora"
touch "$TNS_FILE"
sed -i '/^{{primary_unique_name}} =/,/^$/d' "$TNS_FILE"
sed -i '/^{{standby_unique_name}} =/,/^$/d' "$TNS_FILE"
cat <<'TNSEND' >> "$TNS_FILE"
{{primary_unique_name}} =
  (DESCRIPTION =
    (ADDRESS = (PROTOCOL = TCP)(HOST = {{primary_address}})(PORT = {{listener_port}}))
    (CONNECT_DATA =
      (SERVER = DEDICATED)
      (SERVICE_NAME = {{db_name}})
    )
  )

{{standby_unique_name}} =
  (DESCRIPTION =
    (ADDRESS = (PROTOCOL = TCP)(HOST = {{standby_address}})(PORT = {{listener_port}}))
    (CONNECT_DATA =
      (SERVER = DEDICATED)
      (SERVICE_NAME = {{db_name}})
    )
  )

TNSEND
EOF
done
"#,
            Postcondition::exit_zero(
                "sudo su - oracle -c 'tnsping {{primary_unique_name}} && tnsping {{standby_unique_name}}'",
            ),
        ),
        StepDefinition::new(
            "configure_static_listener",
            StepTarget::Both,
            r#"sudo su - grid <<'EOF'
LISTENER_ORA="$ORACLE_HOME/network/admin/listener.ora"
if ! grep -q "SID_LIST_LISTENER" "$LISTENER_ORA"; then
    cat >> "$LISTENER_ORA" <<LISTEND

SID_LIST_LISTENER =
  (SID_LIST =
    (SID_DESC =
      (GLOBAL_DBNAME = {{db_name}})
      (ORACLE_HOME = $ORACLE_ORACLE_HOME)
      (SID_NAME = {{db_name}})
    )
  )
LISTEND
fi
lsnrctl reload
EOF
"#,
            Postcondition::contains(
                "sudo su - grid -c 'lsnrctl status' | grep -q 'Service \"{{db_name}}\"' && echo LISTENER_READY",
                "LISTENER_READY",
            ),
        ),
        StepDefinition::new(
            "configure_primary_for_dataguard",
            StepTarget::Primary,
            sysdba(
                None,
                r#"DECLARE
    v_forced VARCHAR2(3);
BEGIN
    SELECT FORCE_LOGGING INTO v_forced FROM V$DATABASE;
    IF v_forced <> 'YES' THEN
        EXECUTE IMMEDIATE 'ALTER DATABASE FORCE LOGGING';
    END IF;
END;
/
ALTER SYSTEM SET DB_UNIQUE_NAME='{{primary_unique_name}}' SCOPE=SPFILE;
ALTER SYSTEM SET LOG_ARCHIVE_CONFIG='DG_CONFIG=({{primary_unique_name}},{{standby_unique_name}})' SCOPE=BOTH;
ALTER SYSTEM SET LOG_ARCHIVE_DEST_1='LOCATION=USE_DB_RECOVERY_FILE_DEST VALID_FOR=(ALL_LOGFILES,ALL_ROLES) DB_UNIQUE_NAME={{primary_unique_name}}' SCOPE=BOTH;
ALTER SYSTEM SET LOG_ARCHIVE_DEST_2='SERVICE={{standby_unique_name}} ASYNC VALID_FOR=(ONLINE_LOGFILES,PRIMARY_ROLE) DB_UNIQUE_NAME={{standby_unique_name}} REOPEN=60 MAX_FAILURE=0' SCOPE=BOTH;
ALTER SYSTEM SET STANDBY_FILE_MANAGEMENT=AUTO SCOPE=BOTH;
ALTER SYSTEM SET FAL_SERVER='{{standby_unique_name}}' SCOPE=BOTH;
DECLARE
    v_log_size NUMBER;
    v_groups NUMBER;
    v_existing NUMBER;
BEGIN
    SELECT COUNT(*) INTO v_existing FROM V$STANDBY_LOG;
    IF v_existing = 0 THEN
        SELECT MAX(BYTES)/1024/1024, COUNT(*) INTO v_log_size, v_groups FROM V$LOG;
        FOR i IN 1..v_groups+1 LOOP
            EXECUTE IMMEDIATE 'ALTER DATABASE ADD STANDBY LOGFILE SIZE ' || v_log_size || 'M';
        END LOOP;
    END IF;
END;
/"#,
            ),
            Postcondition::contains(
                sysdba(
                    None,
                    "SELECT 'PRIMARY_DG_READY' FROM V$DATABASE WHERE FORCE_LOGGING = 'YES'
  AND (SELECT COUNT(*) FROM V$STANDBY_LOG) > 0
  AND (SELECT VALUE FROM V$PARAMETER WHERE NAME = 'log_archive_config') LIKE '%{{standby_unique_name}}%';",
                ),
                "PRIMARY_DG_READY",
            ),
        ),
        // The marker file records that the password file was created by us, so
        // a re-run neither regenerates it nor restarts the primary.
        StepDefinition::new(
            "setup_password_file",
            StepTarget::Primary,
            r#"sudo su - oracle <<'EOF'
MARKER=$HOME/.dgc_orapw_{{db_name}}
if [ -f "$MARKER" ] && [ -f "$ORACLE_HOME/dbs/orapw{{db_name}}" ]; then
    exit 0
fi
set -e
orapwd file=$ORACLE_HOME/dbs/orapw{{db_name}} password='{{sys_password}}' entries=10 force=y
sqlplus -s / as sysdba <<'SQLEND'
WHENEVER SQLERROR EXIT FAILURE
ALTER USER SYS IDENTIFIED BY "{{sys_password}}";
SQLEND
srvctl stop database -d {{db_name}}
srvctl start database -d {{db_name}}
touch "$MARKER"
EOF
"#,
            Postcondition::contains(
                "sudo su - oracle -c 'test -f $HOME/.dgc_orapw_{{db_name}} && test -s $ORACLE_HOME/dbs/orapw{{db_name}} && echo ORAPW_READY'",
                "ORAPW_READY",
            ),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Phase 2: standby creation
// ---------------------------------------------------------------------------

fn duplication_steps() -> Vec<StepDefinition> {
    vec![
        // Hands the primary's password file forward: the checksum as a plain
        // capture, the content as a sensitive one that never reaches the log.
        StepDefinition::new(
            "export_password_file",
            StepTarget::Primary,
            r#"source ~/.bash_profile
ORAPW=$ORACLE_HOME/dbs/orapw{{db_name}}
echo "ORAPW_MD5=$(sudo md5sum $ORAPW | awk '{print $1}')"
echo "ORAPW_B64=$(sudo base64 -w0 $ORAPW)"
"#,
            Postcondition::exit_zero("source ~/.bash_profile && sudo test -s $ORACLE_HOME/dbs/orapw{{db_name}}"),
        )
        .capture("orapw_md5", Role::Primary, ORAPW_MD5_PREFIX)
        .capture_sensitive("orapw_b64", Role::Primary, ORAPW_B64_PREFIX),
        StepDefinition::new(
            "remove_standby_database",
            StepTarget::Standby,
            r#"if [ -f /home/oracle/.dgc_standby_{{db_name}} ]; then
    exit 0
fi
sudo su - oracle <<'EOF'
srvctl stop database -d {{standby_old_db_name}} -f 2>/dev/null || true
srvctl remove database -d {{standby_old_db_name}} -f 2>/dev/null || true
EOF
sudo su - grid <<'EOF'
asmcmd rm -rf +{{standby_diskgroup}}/{{standby_old_db_name}} 2>/dev/null || true
EOF
source ~/.bash_profile
sudo rm -f $ORACLE_HOME/dbs/*{{standby_old_db_name}}* 2>/dev/null || true
"#,
            Postcondition::contains(
                "sudo su - grid -c 'asmcmd ls +{{standby_diskgroup}}/{{standby_old_db_name}}' >/dev/null 2>&1 || echo OLD_DB_ABSENT",
                "OLD_DB_ABSENT",
            ),
        )
        .run_once(),
        StepDefinition::new(
            "create_standby_pfile",
            StepTarget::Standby,
            r#"sudo su - oracle <<'EOF'
mkdir -p /u01/app/oracle/admin/{{db_name}}/adump
cat > $ORACLE_HOME/dbs/init{{db_name}}.ora <<'PFILEEND'
db_name='{{db_name}}'
db_unique_name='{{standby_unique_name}}'
db_block_size=8192
sga_target=1G
pga_aggregate_target=256M
processes=300
audit_file_dest='/u01/app/oracle/admin/{{db_name}}/adump'
audit_trail='db'
compatible='19.0.0'
control_files='+{{standby_diskgroup}}/{{db_name}}/controlfile/control01.ctl'
db_recovery_file_dest='+{{standby_diskgroup}}'
db_recovery_file_dest_size=10G
diagnostic_dest='/u01/app/oracle'
dispatchers='(PROTOCOL=TCP) (SERVICE={{db_name}}XDB)'
enable_pluggable_database=true
log_archive_config='DG_CONFIG=({{primary_unique_name}},{{standby_unique_name}})'
log_archive_dest_1='LOCATION=USE_DB_RECOVERY_FILE_DEST VALID_FOR=(ALL_LOGFILES,ALL_ROLES) DB_UNIQUE_NAME={{standby_unique_name}}'
log_archive_dest_2='SERVICE={{primary_unique_name}} ASYNC VALID_FOR=(ONLINE_LOGFILES,PRIMARY_ROLE) DB_UNIQUE_NAME={{primary_unique_name}}'
fal_server='{{primary_unique_name}}'
remote_login_passwordfile='exclusive'
standby_file_management='AUTO'
PFILEEND
EOF
"#,
            Postcondition::contains(
                "sudo su - oracle -c 'grep -q \"db_unique_name=.{{standby_unique_name}}.\" $ORACLE_HOME/dbs/init{{db_name}}.ora && echo PFILE_READY'",
                "PFILE_READY",
            ),
        ),
        StepDefinition::new(
            "install_password_file",
            StepTarget::Standby,
            install_password_script(),
            orapw_matches_primary(),
        ),
        StepDefinition::new(
            "start_standby_nomount",
            StepTarget::Standby,
            r#"sudo su - oracle <<'EOF'
sed -i 's/^export ORACLE_SID=.*/export ORACLE_SID={{db_name}}/' /home/oracle/.bash_profile
export ORACLE_SID={{db_name}}
if pgrep -f "ora_pmon_{{db_name}}$" >/dev/null; then
    exit 0
fi
sqlplus -s / as sysdba <<SQLEND
WHENEVER SQLERROR EXIT FAILURE
STARTUP NOMOUNT PFILE='$ORACLE_HOME/dbs/init{{db_name}}.ora';
SQLEND
EOF
"#,
            Postcondition::contains(
                sysdba(Some("{{db_name}}"), "SELECT 'INSTANCE|' || STATUS FROM V$INSTANCE;"),
                "INSTANCE|",
            ),
        ),
        StepDefinition::new(
            "duplicate_database",
            StepTarget::Standby,
            r#"sudo su - oracle <<'EOF'
export ORACLE_SID={{db_name}}
ROLE=$(sqlplus -s / as sysdba <<'SQLEND'
SET HEADING OFF FEEDBACK OFF PAGESIZE 0
WHENEVER SQLERROR EXIT FAILURE
SELECT DATABASE_ROLE FROM V$DATABASE;
SQLEND
)
if echo "$ROLE" | grep -q "PHYSICAL STANDBY"; then
    touch /home/oracle/.dgc_standby_{{db_name}}
    exit 0
fi
set -e
rman TARGET sys/"{{sys_password}}"@//{{primary_address}}:{{listener_port}}/{{db_name}} AUXILIARY sys/"{{sys_password}}"@//{{standby_address}}:{{listener_port}}/{{db_name}} <<'RMANEND'
DUPLICATE TARGET DATABASE
  FOR STANDBY
  FROM ACTIVE DATABASE
  DORECOVER
  SPFILE
    SET db_unique_name='{{standby_unique_name}}'
    SET control_files='+{{standby_diskgroup}}'
    SET db_file_name_convert='+{{primary_diskgroup}}','+{{standby_diskgroup}}'
    SET log_file_name_convert='+{{primary_diskgroup}}','+{{standby_diskgroup}}'
    SET log_archive_dest_1='LOCATION=USE_DB_RECOVERY_FILE_DEST VALID_FOR=(ALL_LOGFILES,ALL_ROLES) DB_UNIQUE_NAME={{standby_unique_name}}'
    SET log_archive_dest_2='SERVICE=//{{primary_address}}:{{listener_port}}/{{db_name}} ASYNC VALID_FOR=(ONLINE_LOGFILES,PRIMARY_ROLE) DB_UNIQUE_NAME={{primary_unique_name}}'
    SET fal_server='//{{primary_address}}:{{listener_port}}/{{db_name}}'
    SET db_recovery_file_dest='+{{standby_diskgroup}}'
  NOFILENAMECHECK;
RMANEND
touch /home/oracle/.dgc_standby_{{db_name}}
EOF
"#,
            Postcondition::contains(
                sysdba(
                    Some("{{db_name}}"),
                    "SELECT 'ROLE|' || DATABASE_ROLE FROM V$DATABASE;",
                ),
                "ROLE|PHYSICAL STANDBY",
            ),
        )
        .run_once()
        .timeout(DUPLICATION_TIMEOUT),
        // Duplication writes a fresh password file on the standby; put the
        // primary's back and remount only if it differs.
        StepDefinition::new(
            "sync_password_file",
            StepTarget::Standby,
            format!(
                "{}\nif [ \"$CHANGED\" = 1 ]; then\n{}fi\n",
                install_password_script(),
                sysdba(Some("{{db_name}}"), "SHUTDOWN IMMEDIATE;\nSTARTUP MOUNT;")
            ),
            orapw_matches_primary(),
        ),
        StepDefinition::new(
            "fix_standby_redo_logs",
            StepTarget::Standby,
            format!(
                "if [ -f /home/oracle/.dgc_srl_{{{{db_name}}}} ]; then\n    exit 0\nfi\nset -e\n{}sudo su - oracle -c 'touch /home/oracle/.dgc_srl_{{{{db_name}}}}'\n",
                sysdba(Some("{{db_name}}"), FIX_REDO_LOGS_SQL)
            ),
            Postcondition::contains(
                sysdba(
                    Some("{{db_name}}"),
                    "SELECT CASE WHEN (SELECT COUNT(*) FROM V$STANDBY_LOG) > (SELECT COUNT(*) FROM V$LOG)
  AND (SELECT COUNT(*) FROM V$LOGFILE WHERE MEMBER NOT LIKE '+%/%') = 0
  THEN 'SRL_OK' ELSE 'SRL_MISSING' END FROM DUAL;",
                ),
                "SRL_OK",
            ),
        ),
        StepDefinition::new(
            "register_standby_with_cluster",
            StepTarget::Standby,
            r#"sudo su - oracle <<'EOF'
srvctl config database -d {{db_name}} >/dev/null 2>&1 || \
  srvctl add database -d {{db_name}} -o $ORACLE_HOME -r PHYSICAL_STANDBY -s MOUNT -diskgroup {{standby_diskgroup}}
srvctl status database -d {{db_name}} | grep -q "is running" || srvctl start database -d {{db_name}} -o mount
EOF
"#,
            Postcondition::contains(
                "sudo su - oracle -c 'srvctl status database -d {{db_name}}'",
                "is running",
            ),
        ),
    ]
}

fn install_password_script() -> String {
    r#"source ~/.bash_profile
ORAPW=$ORACLE_HOME/dbs/orapw{{db_name}}
CHANGED=0
if [ "$(sudo md5sum $ORAPW 2>/dev/null | awk '{print $1}')" != "{{orapw_md5}}" ]; then
    echo '{{orapw_b64}}' | base64 -d | sudo tee $ORAPW >/dev/null
    sudo chown oracle:oinstall $ORAPW
    sudo chmod 640 $ORAPW
    CHANGED=1
fi
"#
    .to_string()
}

fn orapw_matches_primary() -> Postcondition {
    Postcondition::equals(
        "source ~/.bash_profile && sudo md5sum $ORACLE_HOME/dbs/orapw{{db_name}} | awk '{print $1}'",
        "{{orapw_md5}}",
    )
}

const FIX_REDO_LOGS_SQL: &str = r#"ALTER SYSTEM SET STANDBY_FILE_MANAGEMENT=MANUAL SCOPE=BOTH;
DECLARE
    v_log_size NUMBER;
    v_online NUMBER;
    v_max_group NUMBER;
BEGIN
    SELECT NVL(MAX(BYTES)/1024/1024, 100), COUNT(*), MAX(GROUP#)
      INTO v_log_size, v_online, v_max_group FROM V$LOG;

    FOR rec IN (
        SELECT DISTINCT l.GROUP#, l.STATUS FROM V$LOG l, V$LOGFILE f
        WHERE l.GROUP# = f.GROUP# AND f.MEMBER NOT LIKE '+%/%'
        ORDER BY l.GROUP#
    ) LOOP
        IF rec.STATUS = 'CURRENT' THEN
            EXECUTE IMMEDIATE 'ALTER DATABASE CLEAR LOGFILE GROUP ' || rec.GROUP#;
        END IF;
        EXECUTE IMMEDIATE 'ALTER DATABASE DROP LOGFILE GROUP ' || rec.GROUP#;
        EXECUTE IMMEDIATE 'ALTER DATABASE ADD LOGFILE GROUP ' || rec.GROUP#
            || ' (''+{{standby_diskgroup}}'') SIZE ' || v_log_size || 'M';
    END LOOP;

    FOR rec IN (SELECT GROUP# FROM V$STANDBY_LOG) LOOP
        EXECUTE IMMEDIATE 'ALTER DATABASE DROP STANDBY LOGFILE GROUP ' || rec.GROUP#;
    END LOOP;
    FOR i IN 1..(v_online + 1) LOOP
        EXECUTE IMMEDIATE 'ALTER DATABASE ADD STANDBY LOGFILE GROUP ' || (v_max_group + i)
            || ' (''+{{standby_diskgroup}}'') SIZE ' || v_log_size || 'M';
    END LOOP;
END;
/
ALTER SYSTEM SET STANDBY_FILE_MANAGEMENT=AUTO SCOPE=BOTH;"#;

// ---------------------------------------------------------------------------
// Phase 3: replication
// ---------------------------------------------------------------------------

fn replication_steps() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new(
            "start_managed_recovery",
            StepTarget::Standby,
            sysdba(
                Some("{{db_name}}"),
                r#"DECLARE
    v_running NUMBER;
BEGIN
    SELECT COUNT(*) INTO v_running FROM V$MANAGED_STANDBY WHERE PROCESS LIKE 'MRP%';
    IF v_running = 0 THEN
        EXECUTE IMMEDIATE 'ALTER DATABASE RECOVER MANAGED STANDBY DATABASE DISCONNECT FROM SESSION';
    END IF;
END;
/"#,
            ),
            Postcondition::contains(
                sysdba(
                    Some("{{db_name}}"),
                    "SELECT 'MRP_RUNNING' FROM V$MANAGED_STANDBY WHERE PROCESS LIKE 'MRP%' AND ROWNUM = 1;",
                ),
                "MRP_RUNNING",
            ),
        )
        .retryable(),
        // The postcondition checks the destination is enabled, not that it is
        // VALID: shipping errors are the verifier's to report.
        StepDefinition::new(
            "enable_log_shipping",
            StepTarget::Primary,
            sysdba(
                None,
                "ALTER SYSTEM SET LOG_ARCHIVE_DEST_2='SERVICE=//{{standby_address}}:{{listener_port}}/{{db_name}} ASYNC VALID_FOR=(ONLINE_LOGFILES,PRIMARY_ROLE) DB_UNIQUE_NAME={{standby_unique_name}} REOPEN=60 MAX_FAILURE=0' SCOPE=BOTH;
ALTER SYSTEM SET LOG_ARCHIVE_DEST_STATE_2=ENABLE SCOPE=BOTH;
ALTER SYSTEM SET LOG_ARCHIVE_CONFIG='DG_CONFIG=({{primary_unique_name}},{{standby_unique_name}})' SCOPE=BOTH;
ALTER SYSTEM SWITCH LOGFILE;",
            ),
            Postcondition::contains(
                sysdba(
                    None,
                    "SELECT 'DEST_STATE|' || UPPER(VALUE) FROM V$PARAMETER WHERE NAME = 'log_archive_dest_state_2';",
                ),
                "DEST_STATE|ENABLE",
            ),
        )
        .retryable(),
    ]
}
