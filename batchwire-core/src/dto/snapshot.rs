//! Registry snapshot DTO

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::record::JobRecord;
use crate::error::RegistryError;

/// Current snapshot format
pub const SNAPSHOT_VERSION: u32 = 1;

/// Point-in-time copy of every tracked job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub records: Vec<JobRecord>,
}

impl RegistrySnapshot {
    pub fn new(records: Vec<JobRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            records,
        }
    }

    /// Rejects snapshots written by an incompatible format version
    pub fn check_version(&self) -> Result<(), RegistryError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(RegistryError::SnapshotVersion {
                expected: SNAPSHOT_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}
