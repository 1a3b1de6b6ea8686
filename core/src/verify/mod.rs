//! Status verifier: read-only assessment of a primary/standby pair.
//!
//! Queries the primary's archive destinations and the standby's role, managed
//! recovery process and apply lag, then classifies the pair with the "worst
//! finding wins" principle:
//!
//! - instance unreachable or status query failed -> DIVERGED
//! - a configured destination in a terminal state -> DIVERGED
//! - a destination in a transient state -> DEGRADED
//! - apply lag above the bound, not reported, or MRP not applying -> DEGRADED
//! - standby not in the PHYSICAL STANDBY role -> DEGRADED
//! - nothing found -> CONVERGED
//!
//! The verifier never mutates either instance.

pub mod parse;

use std::time::Duration;

use tracing::{debug, warn};

use crate::infrastructure::{ExecOutput, RemoteExecutor};
use crate::pipeline::sysdba;
use crate::types::{
    DestinationHealth, Finding, InstanceHandle, InstanceReplicationState, OverallStatus, Role,
};

const APPLYING_STATES: [&str; 2] = ["APPLYING_LOG", "WAIT_FOR_LOG"];
const STANDBY_ROLE: &str = "PHYSICAL STANDBY";

#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    /// `LOG_ARCHIVE_DEST_n` ids inspected on the primary.
    pub destinations: Vec<u32>,
    pub max_apply_lag: Duration,
    pub query_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            destinations: vec![1, 2],
            max_apply_lag: Duration::from_secs(30),
            query_timeout: Duration::from_secs(120),
        }
    }
}

/// Result of one assessment pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub overall: OverallStatus,
    pub findings: Vec<Finding>,
    pub primary: InstanceReplicationState,
    pub standby: InstanceReplicationState,
}

impl Assessment {
    pub fn both_unreachable(&self) -> bool {
        !self.primary.reachable && !self.standby.reachable
    }
}

pub struct StatusVerifier<'a> {
    executor: &'a dyn RemoteExecutor,
    config: VerifierConfig,
}

impl<'a> StatusVerifier<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, config: VerifierConfig) -> Self {
        StatusVerifier { executor, config }
    }

    pub fn assess(&self, primary: &InstanceHandle, standby: &InstanceHandle) -> Assessment {
        let mut findings = Vec::new();
        let primary_state = self.observe_primary(primary, &mut findings);
        let standby_state = self.observe_standby(standby, &mut findings);

        let overall = findings
            .iter()
            .map(Finding::severity)
            .fold(OverallStatus::Converged, OverallStatus::worst);
        debug!(%overall, findings = findings.len(), "assessment complete");

        Assessment {
            overall,
            findings,
            primary: primary_state,
            standby: standby_state,
        }
    }

    /// `Err` carries whether the instance answered at all.
    fn query(
        &self,
        instance: &InstanceHandle,
        script: &str,
        findings: &mut Vec<Finding>,
    ) -> Result<ExecOutput, bool> {
        match self.executor.execute(instance, script, self.config.query_timeout) {
            Ok(out) if out.succeeded() => Ok(out),
            Ok(out) => {
                warn!(instance = instance.id(), exit = out.exit_code, "status query failed");
                findings.push(Finding::Unreachable {
                    instance: instance.id().to_string(),
                    reason: format!("status query exited {}: {}", out.exit_code, out.tail()),
                });
                Err(true)
            }
            Err(e) => {
                warn!(instance = e.instance(), timed_out = e.is_timeout(), error = %e, "instance unreachable");
                findings.push(Finding::Unreachable {
                    instance: instance.id().to_string(),
                    reason: e.to_string(),
                });
                Err(false)
            }
        }
    }

    fn observe_primary(
        &self,
        primary: &InstanceHandle,
        findings: &mut Vec<Finding>,
    ) -> InstanceReplicationState {
        let mut state = InstanceReplicationState::unobserved(primary.id(), Role::Primary);
        let out = match self.query(primary, &destinations_query(&self.config.destinations), findings) {
            Ok(out) => out,
            Err(reachable) => {
                state.reachable = reachable;
                return state;
            }
        };
        state.reachable = true;
        state.destinations = parse::parse_destinations(&out.stdout)
            .into_iter()
            .filter(|d| self.config.destinations.contains(&d.dest_id))
            .collect();

        for id in &self.config.destinations {
            let Some(dest) = state.destinations.iter().find(|d| d.dest_id == *id) else {
                findings.push(Finding::DestinationError {
                    instance: primary.id().to_string(),
                    dest_id: *id,
                    destination: String::new(),
                    status: "NOT REPORTED".into(),
                    error: String::new(),
                });
                continue;
            };
            match dest.status.health() {
                DestinationHealth::Healthy => {}
                DestinationHealth::Transient => findings.push(Finding::DestinationTransient {
                    instance: primary.id().to_string(),
                    dest_id: dest.dest_id,
                    status: dest.status.to_string(),
                }),
                DestinationHealth::Terminal => findings.push(Finding::DestinationError {
                    instance: primary.id().to_string(),
                    dest_id: dest.dest_id,
                    destination: dest.destination.clone(),
                    status: dest.status.to_string(),
                    error: dest.error.clone(),
                }),
            }
        }
        state
    }

    fn observe_standby(
        &self,
        standby: &InstanceHandle,
        findings: &mut Vec<Finding>,
    ) -> InstanceReplicationState {
        let mut state = InstanceReplicationState::unobserved(standby.id(), Role::Standby);
        let out = match self.query(standby, &apply_query(), findings) {
            Ok(out) => out,
            Err(reachable) => {
                state.reachable = reachable;
                return state;
            }
        };
        state.reachable = true;
        let id = standby.id().to_string();

        let Some(apply) = parse::parse_apply(&out.stdout) else {
            findings.push(Finding::ApplyStalled {
                instance: id,
                detail: "standby reported no database role".into(),
            });
            return state;
        };

        if apply.database_role != STANDBY_ROLE {
            findings.push(Finding::RoleMismatch {
                instance: id.clone(),
                observed: apply.database_role.clone(),
            });
        }
        match apply.mrp_status.as_deref() {
            Some(s) if APPLYING_STATES.contains(&s) => {}
            Some(s) => findings.push(Finding::ApplyStalled {
                instance: id.clone(),
                detail: format!("managed recovery is {}", s),
            }),
            None => findings.push(Finding::ApplyStalled {
                instance: id.clone(),
                detail: "managed recovery process is not running".into(),
            }),
        }
        let bound = self.config.max_apply_lag.as_secs();
        match apply.apply_lag_secs {
            Some(lag) if lag > bound => findings.push(Finding::ApplyLag {
                instance: id,
                lag_secs: lag,
                bound_secs: bound,
            }),
            Some(_) => {}
            None => findings.push(Finding::ApplyStalled {
                instance: id,
                detail: "apply lag not reported".into(),
            }),
        }

        state.apply = Some(apply);
        state
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn sysdba_query(header: &str, sql: &str) -> String {
    format!("# dgc assess={}\n{}", header, sysdba(None, sql))
}

pub fn destinations_query(ids: &[u32]) -> String {
    let list = ids
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    sysdba_query(
        "destinations",
        &format!(
            "SELECT 'DEST|' || DEST_ID || '|' || STATUS || '|' || ERROR || '|' || DESTINATION \
             FROM V$ARCHIVE_DEST WHERE DEST_ID IN ({}) ORDER BY DEST_ID;",
            list
        ),
    )
}

pub fn apply_query() -> String {
    sysdba_query(
        "apply",
        "SELECT 'ROLE|' || DATABASE_ROLE || '|' || OPEN_MODE FROM V$DATABASE;
SELECT 'MRP|' || PROCESS || '|' || STATUS FROM V$MANAGED_STANDBY WHERE PROCESS LIKE 'MRP%';
SELECT 'LAG|' || VALUE FROM V$DATAGUARD_STATS WHERE NAME = 'apply lag';",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::ScriptedExecutor;
    use crate::types::{Credentials, Secret};

    fn handle(id: &str, role: Role) -> InstanceHandle {
        InstanceHandle::new(
            id,
            role,
            "10.0.0.1",
            Credentials {
                ssh_user: None,
                sys_password: Secret::new("pw"),
            },
        )
        .unwrap()
    }

    fn pair() -> (InstanceHandle, InstanceHandle) {
        (handle("ora-1", Role::Primary), handle("ora-2", Role::Standby))
    }

    const HEALTHY_DEST: &str = "DEST|1|VALID||USE_DB_RECOVERY_FILE_DEST\nDEST|2|VALID||ORA1_STBY\n";
    const HEALTHY_APPLY: &str = "ROLE|PHYSICAL STANDBY|MOUNTED\nMRP|MRP0|APPLYING_LOG\nLAG|+00 00:00:00\n";

    fn scripted(dest: &str, apply: &str) -> ScriptedExecutor {
        let exec = ScriptedExecutor::new();
        exec.on(Some("ora-1"), "assess=destinations", ExecOutput::success(dest));
        exec.on(Some("ora-2"), "assess=apply", ExecOutput::success(apply));
        exec
    }

    #[test]
    fn healthy_pair_is_converged() {
        let exec = scripted(HEALTHY_DEST, HEALTHY_APPLY);
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Converged);
        assert!(a.findings.is_empty());
        assert_eq!(a.primary.destinations.len(), 2);
        assert_eq!(a.standby.apply.as_ref().unwrap().apply_lag_secs, Some(0));
    }

    #[test]
    fn destination_error_is_diverged() {
        let dest = "DEST|1|VALID||USE_DB_RECOVERY_FILE_DEST\nDEST|2|ERROR|ORA-16191: Primary log shipping client not logged on standby|ORA1_STBY\n";
        let exec = scripted(dest, HEALTHY_APPLY);
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Diverged);
        match &a.findings[0] {
            Finding::DestinationError { dest_id, error, .. } => {
                assert_eq!(*dest_id, 2);
                assert!(error.starts_with("ORA-16191"));
            }
            other => panic!("unexpected finding {:?}", other),
        }
    }

    #[test]
    fn missing_destination_row_is_diverged() {
        let exec = scripted("DEST|1|VALID||USE_DB_RECOVERY_FILE_DEST\n", HEALTHY_APPLY);
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Diverged);
        assert!(a.findings[0].to_string().contains("NOT REPORTED"));
    }

    #[test]
    fn lag_above_bound_is_degraded() {
        let apply = "ROLE|PHYSICAL STANDBY|MOUNTED\nMRP|MRP0|APPLYING_LOG\nLAG|+00 00:02:00\n";
        let exec = scripted(HEALTHY_DEST, apply);
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Degraded);
        assert_eq!(
            a.findings,
            vec![Finding::ApplyLag {
                instance: "ora-2".into(),
                lag_secs: 120,
                bound_secs: 30
            }]
        );
    }

    #[test]
    fn stopped_recovery_and_transient_destination_are_degraded() {
        let dest = "DEST|1|VALID||x\nDEST|2|FULL||ORA1_STBY\n";
        let apply = "ROLE|PHYSICAL STANDBY|MOUNTED\nLAG|+00 00:00:00\n";
        let exec = scripted(dest, apply);
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Degraded);
        assert_eq!(a.findings.len(), 2);
    }

    #[test]
    fn wrong_role_is_degraded() {
        let apply = "ROLE|PRIMARY|READ WRITE\nMRP|MRP0|APPLYING_LOG\nLAG|+00 00:00:00\n";
        let exec = scripted(HEALTHY_DEST, apply);
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Degraded);
        assert!(matches!(a.findings[0], Finding::RoleMismatch { .. }));
    }

    #[test]
    fn unreachable_standby_is_diverged() {
        let exec = scripted(HEALTHY_DEST, HEALTHY_APPLY);
        exec.disconnect("ora-2");
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Diverged);
        assert!(!a.standby.reachable);
        assert!(a.primary.reachable);
        assert!(!a.both_unreachable());
        assert!(matches!(a.findings[0], Finding::Unreachable { .. }));
    }

    #[test]
    fn failed_query_is_diverged_but_reachable() {
        let exec = scripted(HEALTHY_DEST, HEALTHY_APPLY);
        exec.on(
            Some("ora-1"),
            "assess=destinations",
            ExecOutput::failure(1, "ORA-01034: ORACLE not available"),
        );
        let (p, s) = pair();
        let a = StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        assert_eq!(a.overall, OverallStatus::Diverged);
        assert!(a.primary.reachable);
        assert!(a.findings[0].to_string().contains("ORA-01034"));
    }

    #[test]
    fn verifier_only_reads() {
        let exec = scripted(HEALTHY_DEST, HEALTHY_APPLY);
        let (p, s) = pair();
        StatusVerifier::new(&exec, VerifierConfig::default()).assess(&p, &s);
        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.command.contains("SELECT")));
        assert!(calls.iter().all(|c| !c.command.contains("ALTER")));
    }
}
