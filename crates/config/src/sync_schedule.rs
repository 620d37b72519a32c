#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSchedule {
    /// Interval between configuration resync cycles.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub interval: Duration,

    /// Retry interval after an aborted cycle (fetch failure).
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub retry_interval: Duration,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(10),
        }
    }
}
