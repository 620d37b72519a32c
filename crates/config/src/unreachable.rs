#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Unreachable {
    /// Pause before retrying an interface that stopped answering.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub delay: Duration,

    /// Ceiling of the failure-count backoff ladder.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub period: Duration,
}

impl Default for Unreachable {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(15),
            period: Duration::from_secs(45),
        }
    }
}
