//! Database and diskgroup names derived from `ora-<n>` instance ids.

use crate::template::Bindings;
use crate::types::{InstanceError, InstanceNaming};

pub const LISTENER_PORT: u16 = 1521;

/// Names for a primary/standby pair. Both databases share the primary's
/// `DB_NAME`; the standby is told apart by its unique name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataGuardNames {
    pub db_name: String,
    pub primary_unique_name: String,
    pub standby_unique_name: String,
    pub primary_diskgroup: String,
    pub standby_diskgroup: String,
    /// The database the standby instance was installed with, removed before
    /// duplication.
    pub standby_old_db_name: String,
}

impl DataGuardNames {
    pub fn derive(primary_id: &str, standby_id: &str) -> Result<Self, InstanceError> {
        let primary = InstanceNaming::parse(primary_id)?;
        let standby = InstanceNaming::parse(standby_id)?;
        Ok(DataGuardNames {
            db_name: primary.db_name(),
            primary_unique_name: primary.db_name(),
            standby_unique_name: format!("{}_STBY", primary.db_name()),
            primary_diskgroup: primary.cdb_diskgroup(),
            standby_diskgroup: standby.cdb_diskgroup(),
            standby_old_db_name: standby.db_name(),
        })
    }

    pub fn bindings(&self) -> Bindings {
        let mut b = Bindings::new();
        b.insert("db_name".into(), self.db_name.clone());
        b.insert("primary_unique_name".into(), self.primary_unique_name.clone());
        b.insert("standby_unique_name".into(), self.standby_unique_name.clone());
        b.insert("primary_diskgroup".into(), self.primary_diskgroup.clone());
        b.insert("standby_diskgroup".into(), self.standby_diskgroup.clone());
        b.insert("standby_old_db_name".into(), self.standby_old_db_name.clone());
        b.insert("listener_port".into(), LISTENER_PORT.to_string());
        b
    }
}
