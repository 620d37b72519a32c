#![forbid(unsafe_code)]

mod common;

use cache::{
    ConfigCache, DiffRow, HostRow, InterfaceState, ItemKind, ItemRow, MaintenanceKind,
    MaintenanceStatus, PollVerdict, PollerClass, QueuePriority, StaticSource, InterfaceIdent,
    NEVER,
};
use common::{agent_interface, host_row, item_row, new_cache, snmp_interface, snmp_item_row};
use config::Config;
use pretty_assertions::assert_eq;
use std::time::Duration;

const NOW: i64 = 1_700_000_000;

fn snmp_fixture() -> StaticSource {
    StaticSource {
        hosts: vec![DiffRow::add(1, host_row("switch-01"))],
        interfaces: vec![
            DiffRow::add(201, snmp_interface(1, true)),
            DiffRow::add(202, snmp_interface(1, true)),
        ],
        items: vec![
            DiffRow::add(301, snmp_item_row(1, "ifInOctets.1", "1.3.6.1.2.1.2.2.1.10.1", "1m", 201)),
            DiffRow::add(302, snmp_item_row(1, "ifInOctets.2", "1.3.6.1.2.1.2.2.1.10.2", "1m", 201)),
            DiffRow::add(303, snmp_item_row(1, "ifInOctets.3", "1.3.6.1.2.1.2.2.1.10.3", "1m", 201)),
            DiffRow::add(304, snmp_item_row(1, "ifOutOctets.1", "1.3.6.1.2.1.2.2.1.16.1", "1m", 202)),
            DiffRow::add(305, snmp_item_row(1, "ifOutOctets.2", "1.3.6.1.2.1.2.2.1.16.2", "1m", 202)),
        ],
        ..StaticSource::default()
    }
}

#[test]
fn spread_schedule_is_deterministic() {
    let collect = || {
        let cache = new_cache();
        cache.sync(&mut snmp_fixture(), NOW).unwrap();
        let mut checks: Vec<i64> = (301..=305)
            .map(|id| cache.item_nextcheck(id).unwrap())
            .collect();
        checks.sort_unstable();
        checks
    };
    assert_eq!(collect(), collect());
}

#[test]
fn bulk_items_on_one_interface_share_a_slot() {
    let cache = new_cache();
    cache.sync(&mut snmp_fixture(), NOW).unwrap();
    // same interface seed, same delay: one phase
    assert_eq!(
        cache.item_nextcheck(301).unwrap(),
        cache.item_nextcheck(302).unwrap()
    );
    assert_eq!(
        cache.item_nextcheck(301).unwrap(),
        cache.item_nextcheck(303).unwrap()
    );
    assert_ne!(
        cache.item_nextcheck(301).unwrap(),
        cache.item_nextcheck(304).unwrap()
    );
}

#[test]
fn snmp_batches_never_mix_interfaces() {
    let cache = new_cache();
    cache.sync(&mut snmp_fixture(), NOW).unwrap();

    let due = NOW + 61;
    let first = cache.get_poller_items(PollerClass::Snmp, due);
    assert_eq!(first.len(), 3);
    assert!(first.iter().all(|req| req.interface_id == 201));

    let second = cache.get_poller_items(PollerClass::Snmp, due);
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|req| req.interface_id == 202));

    assert!(cache.get_poller_items(PollerClass::Snmp, due).is_empty());
}

#[test]
fn walk_items_do_not_ride_in_bulk_batches() {
    let cache = new_cache();
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(1, host_row("switch-01"))],
        interfaces: vec![DiffRow::add(201, snmp_interface(1, true))],
        items: vec![
            DiffRow::add(301, snmp_item_row(1, "ifInOctets.1", "1.3.6.1.2.1.2.2.1.10.1", "1m", 201)),
            DiffRow::add(302, snmp_item_row(1, "ifInOctets.2", "1.3.6.1.2.1.2.2.1.10.2", "1m", 201)),
            DiffRow::add(303, snmp_item_row(1, "walk.if", "walk[1.3.6.1.2.1.2.2]", "1m", 201)),
        ],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();

    let due = NOW + 61;
    let mut batches = Vec::new();
    loop {
        let batch = cache.get_poller_items(PollerClass::Snmp, due);
        if batch.is_empty() {
            break;
        }
        batches.push(batch);
    }
    assert_eq!(batches.len(), 2);
    for batch in &batches {
        let walk = batch.iter().filter(|req| req.item_id == 303).count();
        assert!(walk == 0 || batch.len() == 1, "walk item travelled with a bulk batch");
    }
}

#[test]
fn batch_size_respects_the_class_ceiling() {
    let mut config = Config::default();
    config.poller.max_snmp_items = 2;
    let cache = ConfigCache::new(config);
    cache.sync(&mut snmp_fixture(), NOW).unwrap();

    let due = NOW + 61;
    assert_eq!(cache.get_poller_items(PollerClass::Snmp, due).len(), 2);
    assert_eq!(cache.get_poller_items(PollerClass::Snmp, due).len(), 1);
}

#[test]
fn trapper_items_are_never_queued() {
    let cache = new_cache();
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(1, host_row("web-01"))],
        items: vec![
            DiffRow::add(301, item_row(1, ItemKind::Trapper, "trap.in", "1m", 0)),
            DiffRow::add(302, item_row(1, ItemKind::Dependent, "calc.from.trap", "1m", 0)),
        ],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();
    assert_eq!(cache.stats().queued_items, 0);
}

#[test]
fn broken_interval_parks_the_item_off_queue() {
    let cache = new_cache();
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(1, host_row("web-01"))],
        items: vec![DiffRow::add(
            301,
            item_row(1, ItemKind::Agent, "vfs.fs.size[/]", "whenever", 0),
        )],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();

    assert_eq!(cache.item_nextcheck(301).unwrap(), NEVER);
    assert!(cache.item_scheduling_error(301).unwrap().is_some());
    assert!(cache.get_poller_items(PollerClass::Normal, NOW + 3600).is_empty());
    // parked items never show as overdue
    assert!(cache.get_item_queue(None, NOW + 3600).is_empty());

    // fixing the interval revives the item
    let mut fix = StaticSource {
        items: vec![DiffRow::update(
            301,
            item_row(1, ItemKind::Agent, "vfs.fs.size[/]", "1m", 0),
        )],
        ..StaticSource::default()
    };
    cache.sync(&mut fix, NOW).unwrap();
    assert!(cache.item_nextcheck(301).unwrap() < NEVER);
    assert_eq!(cache.item_scheduling_error(301).unwrap(), None);
}

#[test]
fn no_data_maintenance_short_circuits_dispatch() {
    let cache = new_cache();
    let in_maintenance = HostRow {
        maintenance_status: MaintenanceStatus::Running,
        maintenance_kind: MaintenanceKind::NoData,
        maintenance_from: NOW - 10,
        ..host_row("web-01")
    };
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(1, in_maintenance)],
        items: vec![DiffRow::add(
            301,
            item_row(1, ItemKind::Agent, "system.cpu.load", "1m", 0),
        )],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();

    let due = cache.item_nextcheck(301).unwrap();
    assert!(cache.get_poller_items(PollerClass::Normal, due).is_empty());
    // the item was rolled forward, not dropped
    assert!(cache.item_nextcheck(301).unwrap() > due);
    assert_eq!(cache.stats().queued_items, 1);
}

#[test]
fn unreachable_interface_walks_the_ladder_and_recovers() {
    let cache = new_cache();
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(10, host_row("edge-01"))],
        interfaces: vec![DiffRow::add(100, agent_interface(10))],
        items: vec![DiffRow::add(
            200,
            item_row(10, ItemKind::Agent, "agent.ping", "1m", 100),
        )],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();

    let ident = InterfaceIdent::Id(100);
    for t in 1..=3 {
        cache
            .availability()
            .set_interface(10, ident.clone(), InterfaceState::Down, "timeout", NOW + t);
    }

    // the down interface still grants its one-shot probe
    let due = NOW + 61;
    let batch = cache.get_poller_items(PollerClass::Normal, due);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].item_id, 200);

    // a network failure moves the item to the unreachable queue
    cache.requeue_items(&[(200, PollVerdict::Unreachable)], due);
    let retry_at = cache.item_nextcheck(200).unwrap();
    assert!(retry_at > due);
    assert!(retry_at <= due + 15);
    assert!(cache.get_poller_items(PollerClass::Normal, retry_at + 1).is_empty());

    let retry = cache.get_poller_items(PollerClass::Unreachable, retry_at + 1);
    assert_eq!(retry.len(), 1);

    // recovery returns the item to its natural class
    cache
        .availability()
        .set_interface(10, ident, InterfaceState::Up, "", retry_at + 2);
    cache.requeue_items(&[(200, PollVerdict::Collected)], retry_at + 2);
    let next = cache.item_nextcheck(200).unwrap();
    assert!(next > retry_at + 2);
    assert_eq!(next % 60, 200 % 60);
    let back = cache.get_poller_items(PollerClass::Normal, next);
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].item_id, 200);
}

#[test]
fn high_priority_bypasses_the_unreachable_throttle() {
    let cache = new_cache();
    let urgent = ItemRow {
        priority: QueuePriority::High,
        ..item_row(10, ItemKind::Agent, "agent.ping", "1m", 100)
    };
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(10, host_row("edge-01"))],
        interfaces: vec![DiffRow::add(100, agent_interface(10))],
        items: vec![DiffRow::add(200, urgent)],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();

    let ident = InterfaceIdent::Id(100);
    for t in 1..=3 {
        cache
            .availability()
            .set_interface(10, ident.clone(), InterfaceState::Down, "timeout", NOW + t);
    }
    // arm the backoff window
    cache.availability().is_pollable(10, &ident, NOW + 4);

    let batch = cache.get_poller_items(PollerClass::Normal, NOW + 61);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].item_id, 200);
}

#[test]
fn collected_items_respread_on_the_grid() {
    let cache = new_cache();
    let mut source = StaticSource {
        hosts: vec![DiffRow::add(1, host_row("web-01"))],
        items: vec![DiffRow::add(
            301,
            item_row(1, ItemKind::Internal, "internal[queue]", "1m", 0),
        )],
        ..StaticSource::default()
    };
    cache.sync(&mut source, NOW).unwrap();

    let due = cache.item_nextcheck(301).unwrap();
    let batch = cache.get_poller_items(PollerClass::Normal, due);
    assert_eq!(batch.len(), 1);

    cache.requeue_items(&[(301, PollVerdict::Collected)], due);
    let next = cache.item_nextcheck(301).unwrap();
    assert!(next > due);
    assert!(next <= due + 60);
    // item-seeded phase survives the round trip
    assert_eq!(next % 60, 301 % 60);
}

#[test]
fn overdue_items_appear_in_queue_diagnostics() {
    let cache = new_cache();
    cache.sync(&mut snmp_fixture(), NOW).unwrap();

    // freshly queued items are not overdue yet
    assert!(cache.get_item_queue(None, NOW + 5).is_empty());
    let late = cache.get_item_queue(Some(Duration::from_secs(6)), NOW + 181);
    assert_eq!(late.len(), 5);
    assert!(late.windows(2).all(|w| w[0].next_check <= w[1].next_check));
    assert!(late.iter().all(|entry| entry.class == PollerClass::Snmp));
}
