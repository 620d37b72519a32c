#![forbid(unsafe_code)]
//! In-process configuration cache for a network monitoring server.
//!
//! The cache holds the entire monitored configuration (hosts, items,
//! interfaces, triggers, ...) in interned, indexed form, merges ordered
//! diff streams into it on a sync schedule, and feeds the poller scheduler
//! from per-class priority queues. Host and interface availability is
//! tracked beside it under a separate lock.

mod avail;
mod cache;
mod diff;
mod error;
mod model;
mod nextcheck;
mod pqueue;
mod sched;
mod store;
mod strpool;
mod sync;

pub use avail::{
    AvailRecord, AvailabilityTracker, HostAlive, InterfaceIdent, InterfaceRecord, InterfaceState,
    Pollability, MAX_INTERFACE_FAILURES,
};
pub use cache::{CacheStats, ConfigCache, PollRequest, PollVerdict, QueueEntry};
pub use diff::{
    ConfigSource, DiffRow, DiffTag, DruleRow, EntityKind, FunctionRow, HostRow, InterfaceRow,
    ItemRow, SnmpDetailsRow, SourceError, StaticSource, TriggerDepRow, TriggerRow, WebTestRow,
};
pub use error::Error;
pub use model::{
    FunctionKind, HostStatus, Id, InterfaceKind, ItemKind, MaintenanceKind, MaintenanceStatus,
    MonitoredStatus, PollerClass, ProxyMode, QueuePriority, SnmpOidKind, TriggerTimerFlags,
    ValueKind, NEVER,
};
pub use nextcheck::{parse_delay, spread_nextcheck, unreachable_nextcheck};
pub use pqueue::IndexedHeap;
pub use store::ElementStore;
pub use strpool::{StrPool, StrRef};
pub use sync::SyncReport;
