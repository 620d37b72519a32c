#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Poller {
    /// Ceiling on a single SNMP batch dequeue.
    pub max_snmp_items: usize,

    /// Ceiling on a single Java/JMX batch dequeue.
    pub max_java_items: usize,

    /// Ceiling on a single pinger batch dequeue.
    pub max_pinger_items: usize,

    /// Lower bound of the default queue diagnostics window.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub queue_from: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            max_snmp_items: 128,
            max_java_items: 32,
            max_pinger_items: 128,
            queue_from: Duration::from_secs(6),
        }
    }
}
