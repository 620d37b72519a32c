#![allow(dead_code)]

use cache::{
    ConfigCache, HostRow, HostStatus, InterfaceKind, InterfaceRow, ItemKind, ItemRow,
    MaintenanceKind, MaintenanceStatus, MonitoredStatus, QueuePriority, SnmpDetailsRow, ValueKind,
};
use config::Config;

pub fn new_cache() -> ConfigCache {
    ConfigCache::new(Config::default())
}

pub fn host_row(name: &str) -> HostRow {
    HostRow {
        name: name.into(),
        visible_name: name.into(),
        status: HostStatus::Monitored,
        proxy_id: 0,
        maintenance_status: MaintenanceStatus::Idle,
        maintenance_kind: MaintenanceKind::WithData,
        maintenance_from: 0,
    }
}

pub fn passive_proxy_row(name: &str) -> HostRow {
    HostRow {
        status: HostStatus::ProxyPassive,
        ..host_row(name)
    }
}

pub fn agent_interface(host_id: u64) -> InterfaceRow {
    InterfaceRow {
        host_id,
        kind: InterfaceKind::Agent,
        addr: "192.0.2.10".into(),
        port: "10050".into(),
        main: true,
        snmp: None,
    }
}

pub fn snmp_interface(host_id: u64, bulk: bool) -> InterfaceRow {
    InterfaceRow {
        host_id,
        kind: InterfaceKind::Snmp,
        addr: "192.0.2.20".into(),
        port: "161".into(),
        main: true,
        snmp: Some(SnmpDetailsRow {
            community: "public".into(),
            version: 2,
            bulk,
            max_repetitions: 10,
        }),
    }
}

pub fn item_row(host_id: u64, kind: ItemKind, key: &str, delay: &str, interface_id: u64) -> ItemRow {
    ItemRow {
        host_id,
        kind,
        key: key.into(),
        value_kind: ValueKind::Unsigned,
        delay: delay.into(),
        interface_id,
        status: MonitoredStatus::Active,
        priority: QueuePriority::Normal,
        snmp_oid: None,
        discovery_rule: false,
        master_id: 0,
    }
}

pub fn snmp_item_row(host_id: u64, key: &str, oid: &str, delay: &str, interface_id: u64) -> ItemRow {
    ItemRow {
        snmp_oid: Some(oid.into()),
        ..item_row(host_id, ItemKind::SnmpAgent, key, delay, interface_id)
    }
}
