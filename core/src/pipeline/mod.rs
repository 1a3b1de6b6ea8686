//! Step pipelines.
//!
//! `dataguard` builds the ordered steps that turn two installed instances into
//! a primary/standby pair. `setup` builds the single-instance steps that
//! prepare and install one instance. Commands are `{{name}}` templates; the
//! orchestrator renders them per target.

pub mod dataguard;
pub mod names;
pub mod setup;

pub use dataguard::{dataguard_pipeline, DataGuardOptions};
pub use names::DataGuardNames;
pub use setup::{instance_setup_pipeline, kernel_pipeline, SetupLayout, SetupOptions};

/// Wrap SQL in a `sqlplus / as sysdba` session run as the oracle user. Any
/// SQL error ends the session with a failing exit status.
pub(crate) fn sysdba(sid: Option<&str>, sql: &str) -> String {
    let sid = sid
        .map(|s| format!("export ORACLE_SID={}\n", s))
        .unwrap_or_default();
    format!(
        "sudo su - oracle <<'ORAEOF'
{sid}sqlplus -s / as sysdba <<'SQL'
WHENEVER SQLERROR EXIT FAILURE
WHENEVER OSERROR EXIT FAILURE
SET HEADING OFF FEEDBACK OFF PAGESIZE 0 LINESIZE 400 TRIMSPOOL ON SERVEROUTPUT ON
{sql}
EXIT
SQL
ORAEOF
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysdba_wraps_sql() {
        let s = sysdba(Some("{{db_name}}"), "SELECT 1 FROM DUAL;");
        assert!(s.starts_with("sudo su - oracle <<'ORAEOF'\nexport ORACLE_SID={{db_name}}\n"));
        assert!(s.contains("WHENEVER SQLERROR EXIT FAILURE"));
        assert!(s.contains("SELECT 1 FROM DUAL;\nEXIT\nSQL\nORAEOF\n"));
        assert!(!sysdba(None, "x").contains("ORACLE_SID"));
    }
}
