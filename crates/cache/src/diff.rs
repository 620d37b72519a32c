#![forbid(unsafe_code)]

use crate::model::{
    HostStatus, Id, InterfaceKind, ItemKind, MaintenanceKind, MaintenanceStatus, MonitoredStatus,
    QueuePriority, TriggerTimerFlags, ValueKind,
};
use std::fmt;

/// How a diff row applies to the cache. Remove rows are grouped at the end
/// of each stream; the sync engine relies on that ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffTag {
    Add,
    Update,
    Remove,
}

/// One tagged row describing a single entity as of the current sync cycle.
#[derive(Debug, Clone)]
pub struct DiffRow<T> {
    pub id: Id,
    pub tag: DiffTag,
    /// Field payload; `None` for Remove rows.
    pub row: Option<T>,
}

impl<T> DiffRow<T> {
    pub fn add(id: Id, row: T) -> Self {
        Self {
            id,
            tag: DiffTag::Add,
            row: Some(row),
        }
    }

    pub fn update(id: Id, row: T) -> Self {
        Self {
            id,
            tag: DiffTag::Update,
            row: Some(row),
        }
    }

    pub fn remove(id: Id) -> Self {
        Self {
            id,
            tag: DiffTag::Remove,
            row: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostRow {
    pub name: String,
    pub visible_name: String,
    pub status: HostStatus,
    pub proxy_id: Id,
    pub maintenance_status: MaintenanceStatus,
    pub maintenance_kind: MaintenanceKind,
    pub maintenance_from: i64,
}

#[derive(Debug, Clone)]
pub struct SnmpDetailsRow {
    pub community: String,
    pub version: u8,
    pub bulk: bool,
    pub max_repetitions: i32,
}

#[derive(Debug, Clone)]
pub struct InterfaceRow {
    pub host_id: Id,
    pub kind: InterfaceKind,
    pub addr: String,
    pub port: String,
    pub main: bool,
    pub snmp: Option<SnmpDetailsRow>,
}

#[derive(Debug, Clone)]
pub struct ItemRow {
    pub host_id: Id,
    pub kind: ItemKind,
    pub key: String,
    pub value_kind: ValueKind,
    pub delay: String,
    pub interface_id: Id,
    pub status: MonitoredStatus,
    pub priority: QueuePriority,
    pub snmp_oid: Option<String>,
    pub discovery_rule: bool,
    pub master_id: Id,
}

#[derive(Debug, Clone)]
pub struct FunctionRow {
    pub trigger_id: Id,
    pub item_id: Id,
    pub name: String,
    pub parameter: String,
}

#[derive(Debug, Clone)]
pub struct TriggerRow {
    pub status: MonitoredStatus,
    pub timer: TriggerTimerFlags,
}

#[derive(Debug, Clone)]
pub struct TriggerDepRow {
    pub trigger_id: Id,
    pub depends_on: Id,
}

#[derive(Debug, Clone)]
pub struct DruleRow {
    pub proxy_id: Id,
    pub delay: i64,
    pub status: MonitoredStatus,
}

#[derive(Debug, Clone)]
pub struct WebTestRow {
    pub host_id: Id,
    pub delay: i64,
    pub status: MonitoredStatus,
}

/// Entity kinds in FK-dependency order; the sync engine merges streams in
/// exactly this order within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Hosts,
    Interfaces,
    Items,
    Functions,
    Triggers,
    TriggerDeps,
    DiscoveryRules,
    WebTests,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hosts => "hosts",
            Self::Interfaces => "interfaces",
            Self::Items => "items",
            Self::Functions => "functions",
            Self::Triggers => "triggers",
            Self::TriggerDeps => "trigger dependencies",
            Self::DiscoveryRules => "discovery rules",
            Self::WebTests => "web tests",
        };
        f.write_str(name)
    }
}

/// Failure reported by a diff source; any occurrence aborts the whole
/// cycle before commit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SourceError(pub String);

/// Source of ordered diff streams, one per entity kind. The engine fetches
/// every stream before touching the cache, so a failing fetch leaves the
/// previous snapshot untouched.
pub trait ConfigSource {
    fn hosts(&mut self) -> Result<Vec<DiffRow<HostRow>>, SourceError>;
    fn interfaces(&mut self) -> Result<Vec<DiffRow<InterfaceRow>>, SourceError>;
    fn items(&mut self) -> Result<Vec<DiffRow<ItemRow>>, SourceError>;
    fn functions(&mut self) -> Result<Vec<DiffRow<FunctionRow>>, SourceError>;
    fn triggers(&mut self) -> Result<Vec<DiffRow<TriggerRow>>, SourceError>;
    fn trigger_deps(&mut self) -> Result<Vec<DiffRow<TriggerDepRow>>, SourceError>;
    fn discovery_rules(&mut self) -> Result<Vec<DiffRow<DruleRow>>, SourceError>;
    fn web_tests(&mut self) -> Result<Vec<DiffRow<WebTestRow>>, SourceError>;
}

/// In-memory [`ConfigSource`] holding one prepared batch per entity kind.
/// Used by tests and one-shot loaders; each call drains its stream.
#[derive(Debug, Default)]
pub struct StaticSource {
    pub hosts: Vec<DiffRow<HostRow>>,
    pub interfaces: Vec<DiffRow<InterfaceRow>>,
    pub items: Vec<DiffRow<ItemRow>>,
    pub functions: Vec<DiffRow<FunctionRow>>,
    pub triggers: Vec<DiffRow<TriggerRow>>,
    pub trigger_deps: Vec<DiffRow<TriggerDepRow>>,
    pub discovery_rules: Vec<DiffRow<DruleRow>>,
    pub web_tests: Vec<DiffRow<WebTestRow>>,
}

impl ConfigSource for StaticSource {
    fn hosts(&mut self) -> Result<Vec<DiffRow<HostRow>>, SourceError> {
        Ok(std::mem::take(&mut self.hosts))
    }

    fn interfaces(&mut self) -> Result<Vec<DiffRow<InterfaceRow>>, SourceError> {
        Ok(std::mem::take(&mut self.interfaces))
    }

    fn items(&mut self) -> Result<Vec<DiffRow<ItemRow>>, SourceError> {
        Ok(std::mem::take(&mut self.items))
    }

    fn functions(&mut self) -> Result<Vec<DiffRow<FunctionRow>>, SourceError> {
        Ok(std::mem::take(&mut self.functions))
    }

    fn triggers(&mut self) -> Result<Vec<DiffRow<TriggerRow>>, SourceError> {
        Ok(std::mem::take(&mut self.triggers))
    }

    fn trigger_deps(&mut self) -> Result<Vec<DiffRow<TriggerDepRow>>, SourceError> {
        Ok(std::mem::take(&mut self.trigger_deps))
    }

    fn discovery_rules(&mut self) -> Result<Vec<DiffRow<DruleRow>>, SourceError> {
        Ok(std::mem::take(&mut self.discovery_rules))
    }

    fn web_tests(&mut self) -> Result<Vec<DiffRow<WebTestRow>>, SourceError> {
        Ok(std::mem::take(&mut self.web_tests))
    }
}
