use crate::diff::{EntityKind, SourceError};

/// Represents all possible errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host id is not present in the cache.
    #[error("unknown host {0}")]
    UnknownHost(u64),

    /// The item id is not present in the cache.
    #[error("unknown item {0}")]
    UnknownItem(u64),

    /// The proxy id is not present in the cache.
    #[error("unknown proxy {0}")]
    UnknownProxy(u64),

    /// An item's update interval could not be parsed. The item is parked on
    /// the far-future sentinel until its configuration is fixed.
    #[error("invalid update interval {delay:?}: {reason}")]
    InvalidInterval { delay: String, reason: String },

    /// Fetching a diff stream failed; the cycle was aborted before commit
    /// and the previously committed snapshot stays authoritative.
    #[error("sync cycle aborted while fetching {kind} diff: {source}")]
    SyncAborted {
        kind: EntityKind,
        source: SourceError,
    },

    /// The host has no availability record. Distinct from a record in the
    /// Unknown state.
    #[error("no availability record for host {0}")]
    NoAvailabilityRecord(u64),
}
