#![forbid(unsafe_code)]

use crate::strpool::StrRef;
use bitflags::bitflags;

/// Entity ids are 64-bit and unique within their table.
pub type Id = u64;

/// Far-future sentinel (2038-01-19) for items parked on a broken interval.
pub const NEVER: i64 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStatus {
    Monitored,
    NotMonitored,
    ProxyActive,
    ProxyPassive,
}

impl HostStatus {
    pub fn is_proxy(self) -> bool {
        matches!(self, Self::ProxyActive | Self::ProxyPassive)
    }

    pub fn is_monitored(self) -> bool {
        matches!(self, Self::Monitored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaintenanceStatus {
    #[default]
    Idle,
    Running,
}

/// Whether a running maintenance window still collects data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaintenanceKind {
    #[default]
    WithData,
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Agent,
    Snmp,
    Ipmi,
    Jmx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Agent,
    SnmpAgent,
    Ipmi,
    Simple,
    Internal,
    Trapper,
    Jmx,
    Calculated,
    Dependent,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Character,
    Log,
    Unsigned,
    Text,
}

/// Shared enabled/disabled status for items, triggers, rules and web tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredStatus {
    Active,
    Disabled,
}

/// Where an entity currently sits with respect to its scheduler queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLocation {
    #[default]
    Nowhere,
    Queue,
    Poller,
}

/// Heap position among entries sharing a nextcheck; High sorts first and
/// bypasses unreachable throttling ("check now").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    High,
    #[default]
    Normal,
    Low,
}

impl QueuePriority {
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Scheduling partition. Each class owns one queue with its own batching
/// rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerClass {
    Normal,
    Unreachable,
    Ipmi,
    Pinger,
    Java,
    Snmp,
}

impl PollerClass {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Unreachable => 1,
            Self::Ipmi => 2,
            Self::Pinger => 3,
            Self::Java => 4,
            Self::Snmp => 5,
        }
    }

    pub const ALL: [PollerClass; Self::COUNT] = [
        Self::Normal,
        Self::Unreachable,
        Self::Ipmi,
        Self::Pinger,
        Self::Java,
        Self::Snmp,
    ];

    /// Classes whose batches must stay homogeneous on the tiebreak.
    pub fn batches_by_tiebreak(self) -> bool {
        matches!(self, Self::Snmp | Self::Java)
    }
}

/// SNMP OID shape; a walk-form OID pins the spread seed to the item id and
/// keeps the item out of bulk-aligned batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnmpOidKind {
    #[default]
    Normal,
    Dynamic,
    Walk,
}

impl SnmpOidKind {
    pub fn classify(oid: &str) -> Self {
        if oid.starts_with("walk[") || oid.starts_with("discovery[") {
            Self::Walk
        } else if oid.contains('{') {
            Self::Dynamic
        } else {
            Self::Normal
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Dynamic => 1,
            Self::Walk => 2,
        }
    }
}

bitflags! {
    /// Per-row dirty flags collected while merging an item diff; they decide
    /// whether the nextcheck is recomputed and how.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u8 {
        /// A value was just collected; reschedule from the poll clock.
        const COLLECTED = 0x01;
        const KEY_CHANGED = 0x04;
        const TYPE_CHANGED = 0x08;
        const DELAY_CHANGED = 0x10;
        const NEW = 0x20;
        const INTERFACE_CHANGED = 0x40;
    }
}

impl ItemFlags {
    /// Flags that force a fresh spread-formula nextcheck.
    pub fn needs_reschedule(self) -> bool {
        self.intersects(
            Self::NEW
                | Self::KEY_CHANGED
                | Self::TYPE_CHANGED
                | Self::DELAY_CHANGED
                | Self::INTERFACE_CHANGED
                | Self::COLLECTED,
        )
    }
}

bitflags! {
    /// Which parts of a trigger expression contain time-based functions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TriggerTimerFlags: u8 {
        const EXPRESSION = 0x01;
        const RECOVERY_EXPRESSION = 0x02;
    }
}

#[derive(Debug)]
pub struct Host {
    pub id: Id,
    /// Technical name, unique across hosts; key of the by-name index.
    pub name: StrRef,
    pub visible_name: StrRef,
    pub status: HostStatus,
    /// Owning proxy id, 0 when monitored directly.
    pub proxy_id: Id,
    pub maintenance_status: MaintenanceStatus,
    pub maintenance_kind: MaintenanceKind,
    pub maintenance_from: i64,
    pub data_expected_from: i64,
    pub revision: u64,
    pub items: Vec<Id>,
    pub interfaces: Vec<Id>,
    pub web_tests: Vec<Id>,
}

impl Host {
    /// True while a no-data maintenance window suppresses polling.
    pub fn in_no_data_maintenance(self: &Host) -> bool {
        self.maintenance_status == MaintenanceStatus::Running
            && self.maintenance_kind == MaintenanceKind::NoData
    }
}

#[derive(Debug)]
pub struct SnmpDetails {
    pub community: StrRef,
    pub version: u8,
    pub bulk: bool,
    pub max_repetitions: i32,
}

#[derive(Debug)]
pub struct Interface {
    pub id: Id,
    pub host_id: Id,
    pub kind: InterfaceKind,
    pub addr: StrRef,
    pub port: StrRef,
    /// Default interface of its kind on the host; key of the host+kind index.
    pub main: bool,
    /// Number of items bound to this interface.
    pub items_num: usize,
    pub snmp: Option<SnmpDetails>,
}

impl Interface {
    pub fn bulk_enabled(&self) -> bool {
        self.snmp.as_ref().is_none_or(|snmp| snmp.bulk)
    }
}

#[derive(Debug)]
pub struct Item {
    pub id: Id,
    pub host_id: Id,
    pub kind: ItemKind,
    /// Unique per host; key of the host+key index.
    pub key: StrRef,
    pub value_kind: ValueKind,
    /// Update interval expression, parsed on every reschedule.
    pub delay: StrRef,
    /// Bound interface id, 0 when the item needs none.
    pub interface_id: Id,
    pub status: MonitoredStatus,
    pub poller: Option<PollerClass>,
    pub queue_next_check: i64,
    pub queue_priority: QueuePriority,
    pub location: QueueLocation,
    pub revision: u64,
    /// Set when this item's trigger back-links must be rebuilt in the
    /// post-merge pass.
    pub update_triggers: bool,
    pub data_expected_from: i64,
    pub snmp_oid: Option<StrRef>,
    pub snmp_oid_kind: SnmpOidKind,
    /// Low-level discovery rule flag; part of the SNMP batch tiebreak.
    pub discovery_rule: bool,
    /// Master item id for dependent items, 0 otherwise.
    pub master_id: Id,
    pub dependents: Vec<Id>,
    pub triggers: Vec<Id>,
    /// Last interval-parse failure, surfaced to scheduling callers.
    pub scheduling_error: Option<StrRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Active,
    Passive,
}

/// Proxy record; proxies arrive through the host stream with a proxy
/// status and keep their own table plus queue.
#[derive(Debug)]
pub struct Proxy {
    pub id: Id,
    pub name: StrRef,
    pub mode: ProxyMode,
    pub config_next_check: i64,
    pub data_next_check: i64,
    pub task_next_check: i64,
    pub last_access: i64,
    pub location: QueueLocation,
    /// Max of the proxy's own revision and those of its hosts and their
    /// items; lets a sync peer ask "what changed since R" per proxy.
    pub revision: u64,
    pub hosts: Vec<Id>,
}

impl Proxy {
    pub fn nextcheck(&self) -> i64 {
        self.config_next_check
            .min(self.data_next_check)
            .min(self.task_next_check)
    }
}

#[derive(Debug)]
pub struct Trigger {
    pub id: Id,
    pub status: MonitoredStatus,
    pub timer: TriggerTimerFlags,
    pub revision: u64,
    /// Revision at which a timer entry was last queued; lagging behind
    /// `revision` means the timer must be (re)scheduled.
    pub timer_revision: u64,
    pub functions: Vec<Id>,
    pub item_ids: Vec<Id>,
    /// Triggers this one depends on.
    pub deps_up: Vec<Id>,
    /// Triggers depending on this one.
    pub deps_down: Vec<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Simple,
    /// Evaluates against wall-clock time, so the trigger needs timer
    /// scheduling even without new values.
    TimeBased,
}

impl FunctionKind {
    pub fn classify(name: &str) -> Self {
        match name {
            "nodata" | "date" | "dayofmonth" | "dayofweek" | "now" | "time" => Self::TimeBased,
            _ => Self::Simple,
        }
    }
}

#[derive(Debug)]
pub struct Function {
    pub id: Id,
    pub trigger_id: Id,
    pub item_id: Id,
    pub name: StrRef,
    pub parameter: StrRef,
    pub kind: FunctionKind,
    pub revision: u64,
    pub timer_revision: u64,
}

/// One edge of the trigger dependency graph.
#[derive(Debug)]
pub struct TriggerDep {
    pub id: Id,
    pub trigger_id: Id,
    pub depends_on: Id,
}

#[derive(Debug)]
pub struct DiscoveryRule {
    pub id: Id,
    pub proxy_id: Id,
    pub delay: i64,
    pub status: MonitoredStatus,
    pub next_check: i64,
    pub location: QueueLocation,
    pub revision: u64,
}

#[derive(Debug)]
pub struct WebTest {
    pub id: Id,
    pub host_id: Id,
    pub delay: i64,
    pub status: MonitoredStatus,
    pub next_check: i64,
    pub location: QueueLocation,
    pub revision: u64,
}
