#![forbid(unsafe_code)]

use crate::diff::{
    ConfigSource, DiffRow, DiffTag, DruleRow, EntityKind, FunctionRow, HostRow, InterfaceRow,
    ItemRow, TriggerDepRow, TriggerRow, WebTestRow,
};
use crate::error::Error;
use crate::model::{
    DiscoveryRule, Function, FunctionKind, Host, HostStatus, Id, Interface, InterfaceKind, Item,
    ItemFlags, MaintenanceKind, MaintenanceStatus, MonitoredStatus, Proxy, ProxyMode,
    QueueLocation, SnmpDetails, SnmpOidKind, Trigger, TriggerDep, WebTest,
};
use crate::nextcheck::spread_nextcheck;
use crate::sched::{batch_tiebreak, item_nextcheck_update, poller_class, PollerKey, SchedulerQueues};
use crate::store::ElementStore;
use crate::strpool::{StrPool, StrRef};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Every table and index of the configuration cache, mutated as one unit
/// under the cache write lock.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub strpool: StrPool,
    pub hosts: ElementStore<Host>,
    pub proxies: ElementStore<Proxy>,
    pub interfaces: ElementStore<Interface>,
    pub items: ElementStore<Item>,
    pub functions: ElementStore<Function>,
    pub triggers: ElementStore<Trigger>,
    pub trigger_deps: ElementStore<TriggerDep>,
    pub drules: ElementStore<DiscoveryRule>,
    pub web_tests: ElementStore<WebTest>,
    /// Technical host name to host id.
    pub hosts_by_name: HashMap<StrRef, Id>,
    /// Host id to (item key to item id).
    pub items_by_host_key: HashMap<Id, HashMap<StrRef, Id>>,
    /// Main interface of each kind per host.
    pub interfaces_by_host_kind: HashMap<(Id, InterfaceKind), Id>,
    pub queues: SchedulerQueues,
    /// Committed cache revision, bumped once per changing sync cycle.
    pub revision: u64,
    pub last_sync: i64,
}

/// Cross-entity effects collected while a cycle merges, applied in the
/// relink pass or (for availability) after the cache lock is dropped.
#[derive(Debug, Default)]
pub(crate) struct SyncScratch {
    pub changed: bool,
    /// Hosts whose availability must be forgotten (status or proxy change).
    pub reset_hosts: Vec<Id>,
    /// Hosts whose availability record must be dropped entirely.
    pub removed_hosts: Vec<Id>,
    /// Triggers whose item back-links must be rebuilt.
    pub dirty_triggers: HashSet<Id>,
    /// Function-to-trigger links deferred because the trigger row had not
    /// arrived yet when the function was merged.
    pub pending_links: Vec<(Id, Id)>,
}

/// Outcome of one sync cycle: the committed revision and how many rows of
/// each stream were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub revision: u64,
    pub changed: bool,
    pub hosts: usize,
    pub interfaces: usize,
    pub items: usize,
    pub functions: usize,
    pub triggers: usize,
    pub trigger_deps: usize,
    pub discovery_rules: usize,
    pub web_tests: usize,
}

/// All eight diff streams of one cycle, fetched up front so a failing
/// source never leaves the cache half-merged.
#[derive(Debug, Default)]
pub(crate) struct FetchedBatch {
    hosts: Vec<DiffRow<HostRow>>,
    interfaces: Vec<DiffRow<InterfaceRow>>,
    items: Vec<DiffRow<ItemRow>>,
    functions: Vec<DiffRow<FunctionRow>>,
    triggers: Vec<DiffRow<TriggerRow>>,
    trigger_deps: Vec<DiffRow<TriggerDepRow>>,
    drules: Vec<DiffRow<DruleRow>>,
    web_tests: Vec<DiffRow<WebTestRow>>,
}

impl FetchedBatch {
    pub(crate) fn fetch(source: &mut dyn ConfigSource) -> Result<Self, Error> {
        let abort = |kind: EntityKind| move |source| Error::SyncAborted { kind, source };
        Ok(Self {
            hosts: source.hosts().map_err(abort(EntityKind::Hosts))?,
            interfaces: source.interfaces().map_err(abort(EntityKind::Interfaces))?,
            items: source.items().map_err(abort(EntityKind::Items))?,
            functions: source.functions().map_err(abort(EntityKind::Functions))?,
            triggers: source.triggers().map_err(abort(EntityKind::Triggers))?,
            trigger_deps: source.trigger_deps().map_err(abort(EntityKind::TriggerDeps))?,
            drules: source.discovery_rules().map_err(abort(EntityKind::DiscoveryRules))?,
            web_tests: source.web_tests().map_err(abort(EntityKind::WebTests))?,
        })
    }
}

fn bump_proxy(proxies: &mut ElementStore<Proxy>, proxy_id: Id, rev: u64) {
    if proxy_id == 0 {
        return;
    }
    if let Some(proxy) = proxies.get_mut(proxy_id) {
        proxy.revision = proxy.revision.max(rev);
    }
}

fn bump_host(
    hosts: &mut ElementStore<Host>,
    proxies: &mut ElementStore<Proxy>,
    host_id: Id,
    rev: u64,
) {
    if let Some(host) = hosts.get_mut(host_id) {
        host.revision = rev;
        bump_proxy(proxies, host.proxy_id, rev);
    }
}

fn link_dep_edge(triggers: &mut ElementStore<Trigger>, trigger_id: Id, depends_on: Id) {
    if let Some(trig) = triggers.get_mut(trigger_id) {
        if !trig.deps_up.contains(&depends_on) {
            trig.deps_up.push(depends_on);
        }
    }
    if let Some(trig) = triggers.get_mut(depends_on) {
        if !trig.deps_down.contains(&trigger_id) {
            trig.deps_down.push(trigger_id);
        }
    }
}

fn unlink_dep_edge(triggers: &mut ElementStore<Trigger>, trigger_id: Id, depends_on: Id) {
    if let Some(trig) = triggers.get_mut(trigger_id) {
        trig.deps_up.retain(|&t| t != depends_on);
    }
    if let Some(trig) = triggers.get_mut(depends_on) {
        trig.deps_down.retain(|&t| t != trigger_id);
    }
}

impl CacheState {
    /// Merge one fetched cycle. Streams apply in FK-dependency order, then
    /// the relink and timer passes run, then the cache revision commits.
    pub(crate) fn apply(&mut self, batch: FetchedBatch, now: i64) -> (SyncReport, SyncScratch) {
        let started = Instant::now();
        let rev = self.revision + 1;
        let mut scratch = SyncScratch::default();

        let hosts = self.sync_hosts(batch.hosts, now, rev, &mut scratch);
        let interfaces = self.sync_interfaces(batch.interfaces, rev, &mut scratch);
        let items = self.sync_items(batch.items, now, rev, &mut scratch);
        let functions = self.sync_functions(batch.functions, rev, &mut scratch);
        let triggers = self.sync_triggers(batch.triggers, rev, &mut scratch);
        let trigger_deps = self.sync_trigger_deps(batch.trigger_deps, &mut scratch);
        let discovery_rules = self.sync_drules(batch.drules, now, rev, &mut scratch);
        let web_tests = self.sync_web_tests(batch.web_tests, now, rev, &mut scratch);

        self.relink_triggers(&mut scratch);
        self.schedule_trigger_timers(now);

        if scratch.changed {
            self.revision = rev;
        }
        self.last_sync = now;

        info!(
            revision = self.revision,
            hosts,
            interfaces,
            items,
            functions,
            triggers,
            elapsed = ?started.elapsed(),
            "configuration sync applied",
        );

        let report = SyncReport {
            revision: self.revision,
            changed: scratch.changed,
            hosts,
            interfaces,
            items,
            functions,
            triggers,
            trigger_deps,
            discovery_rules,
            web_tests,
        };
        (report, scratch)
    }

    fn sync_hosts(
        &mut self,
        rows: Vec<DiffRow<HostRow>>,
        now: i64,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.proxies.contains(id) {
                        self.remove_proxy(id, scratch);
                        applied += 1;
                    } else if self.hosts.contains(id) {
                        self.remove_host(id, rev, scratch);
                        applied += 1;
                    }
                }
                (_, Some(row)) if row.status.is_proxy() => {
                    // a host demoted to a proxy keeps the id; tear the old
                    // record down before the other table picks it up
                    if self.hosts.contains(id) {
                        self.remove_host(id, rev, scratch);
                    }
                    self.upsert_proxy(id, row, now, rev, scratch);
                    applied += 1;
                }
                (_, Some(row)) => {
                    if self.proxies.contains(id) {
                        self.remove_proxy(id, scratch);
                    }
                    self.upsert_host(id, row, now, rev, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "host row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_proxy(&mut self, id: Id, row: HostRow, now: i64, rev: u64, scratch: &mut SyncScratch) {
        let Self {
            proxies,
            strpool,
            queues,
            ..
        } = self;
        let mode = if row.status == HostStatus::ProxyActive {
            ProxyMode::Active
        } else {
            ProxyMode::Passive
        };
        let (proxy, found) = proxies.find_or_create(id, |id| Proxy {
            id,
            name: strpool.intern(&row.name),
            mode,
            config_next_check: now,
            data_next_check: now,
            task_next_check: now,
            last_access: 0,
            location: QueueLocation::Nowhere,
            revision: rev,
            hosts: Vec::new(),
        });
        let mut dirty = !found;
        dirty |= strpool.replace(&mut proxy.name, &row.name);
        if proxy.mode != mode {
            proxy.mode = mode;
            dirty = true;
        }
        if dirty {
            proxy.revision = rev;
            scratch.changed = true;
        }
        // passive proxies are polled by this server; active ones connect in.
        // One already handed to a poller keeps its slot until requeued.
        match proxy.mode {
            ProxyMode::Passive => {
                if proxy.location != QueueLocation::Poller {
                    queues.proxies.push(id, proxy.nextcheck());
                    proxy.location = QueueLocation::Queue;
                }
            }
            ProxyMode::Active => {
                queues.proxies.remove(id);
                proxy.location = QueueLocation::Nowhere;
            }
        }
    }

    fn upsert_host(&mut self, id: Id, row: HostRow, now: i64, rev: u64, scratch: &mut SyncScratch) {
        let Self {
            hosts,
            proxies,
            strpool,
            hosts_by_name,
            ..
        } = self;
        let (host, found) = hosts.find_or_create(id, |id| Host {
            id,
            name: strpool.intern(&row.name),
            visible_name: strpool.intern(&row.visible_name),
            status: row.status,
            proxy_id: 0,
            maintenance_status: MaintenanceStatus::Idle,
            maintenance_kind: MaintenanceKind::WithData,
            maintenance_from: 0,
            data_expected_from: now,
            revision: rev,
            items: Vec::new(),
            interfaces: Vec::new(),
            web_tests: Vec::new(),
        });
        let mut dirty = !found;
        if !found {
            hosts_by_name.insert(Arc::clone(&host.name), id);
        }
        if &*host.name != row.name.as_str() {
            hosts_by_name.remove(&*host.name);
            strpool.replace(&mut host.name, &row.name);
            hosts_by_name.insert(Arc::clone(&host.name), id);
            dirty = true;
        }
        dirty |= strpool.replace(&mut host.visible_name, &row.visible_name);
        if host.status != row.status {
            host.status = row.status;
            scratch.reset_hosts.push(id);
            dirty = true;
        }
        if host.proxy_id != row.proxy_id {
            if let Some(old) = proxies.get_mut(host.proxy_id) {
                old.hosts.retain(|&h| h != id);
                old.revision = old.revision.max(rev);
            }
            if let Some(new) = proxies.get_mut(row.proxy_id) {
                new.hosts.push(id);
            }
            host.proxy_id = row.proxy_id;
            scratch.reset_hosts.push(id);
            dirty = true;
        }
        let was_no_data = host.in_no_data_maintenance();
        if host.maintenance_status != row.maintenance_status
            || host.maintenance_kind != row.maintenance_kind
            || host.maintenance_from != row.maintenance_from
        {
            host.maintenance_status = row.maintenance_status;
            host.maintenance_kind = row.maintenance_kind;
            host.maintenance_from = row.maintenance_from;
            dirty = true;
        }
        // leaving a no-data window restarts the "data expected" clock
        if was_no_data && !host.in_no_data_maintenance() {
            host.data_expected_from = now;
        }
        if dirty {
            host.revision = rev;
            let proxy_id = host.proxy_id;
            bump_proxy(proxies, proxy_id, rev);
            scratch.changed = true;
        }
    }

    fn remove_proxy(&mut self, id: Id, scratch: &mut SyncScratch) {
        let Some(proxy) = self.proxies.remove(id) else {
            return;
        };
        self.queues.proxies.remove(id);
        for host_id in proxy.hosts {
            if let Some(host) = self.hosts.get_mut(host_id) {
                host.proxy_id = 0;
            }
        }
        self.strpool.release(&proxy.name);
        scratch.changed = true;
    }

    fn remove_host(&mut self, id: Id, rev: u64, scratch: &mut SyncScratch) {
        let Some(host) = self.hosts.remove(id) else {
            return;
        };
        for &item_id in &host.items {
            self.remove_item(item_id, rev, scratch, false);
        }
        for &iface_id in &host.interfaces {
            self.remove_interface(iface_id, rev, scratch, false);
        }
        for &wt_id in &host.web_tests {
            self.remove_web_test(wt_id, rev, scratch, false);
        }
        self.hosts_by_name.remove(&*host.name);
        self.items_by_host_key.remove(&id);
        if let Some(proxy) = self.proxies.get_mut(host.proxy_id) {
            proxy.hosts.retain(|&h| h != id);
        }
        bump_proxy(&mut self.proxies, host.proxy_id, rev);
        self.strpool.release(&host.name);
        self.strpool.release(&host.visible_name);
        scratch.removed_hosts.push(id);
        scratch.changed = true;
    }

    fn sync_interfaces(
        &mut self,
        rows: Vec<DiffRow<InterfaceRow>>,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.interfaces.contains(id) {
                        self.remove_interface(id, rev, scratch, true);
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    self.upsert_interface(id, row, rev, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "interface row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_interface(&mut self, id: Id, row: InterfaceRow, rev: u64, scratch: &mut SyncScratch) {
        let Self {
            interfaces,
            hosts,
            proxies,
            strpool,
            interfaces_by_host_kind,
            ..
        } = self;
        let (iface, found) = interfaces.find_or_create(id, |id| Interface {
            id,
            host_id: row.host_id,
            kind: row.kind,
            addr: strpool.intern(&row.addr),
            port: strpool.intern(&row.port),
            main: row.main,
            items_num: 0,
            snmp: None,
        });
        let mut dirty = !found;
        if !found {
            if let Some(host) = hosts.get_mut(row.host_id) {
                host.interfaces.push(id);
            }
        }
        if iface.host_id != row.host_id || iface.kind != row.kind {
            if interfaces_by_host_kind.get(&(iface.host_id, iface.kind)) == Some(&id) {
                interfaces_by_host_kind.remove(&(iface.host_id, iface.kind));
            }
            if let Some(old_host) = hosts.get_mut(iface.host_id) {
                old_host.interfaces.retain(|&i| i != id);
            }
            if iface.host_id != row.host_id {
                if let Some(new_host) = hosts.get_mut(row.host_id) {
                    new_host.interfaces.push(id);
                }
            }
            iface.host_id = row.host_id;
            iface.kind = row.kind;
            dirty = true;
        }
        dirty |= strpool.replace(&mut iface.addr, &row.addr);
        dirty |= strpool.replace(&mut iface.port, &row.port);
        if iface.main != row.main {
            iface.main = row.main;
            dirty = true;
        }
        if let Some(new) = row.snmp {
            if let Some(curr) = iface.snmp.as_mut() {
                dirty |= strpool.replace(&mut curr.community, &new.community);
                if curr.version != new.version {
                    curr.version = new.version;
                    dirty = true;
                }
                if curr.bulk != new.bulk {
                    curr.bulk = new.bulk;
                    dirty = true;
                }
                if curr.max_repetitions != new.max_repetitions {
                    curr.max_repetitions = new.max_repetitions;
                    dirty = true;
                }
            } else {
                iface.snmp = Some(SnmpDetails {
                    community: strpool.intern(&new.community),
                    version: new.version,
                    bulk: new.bulk,
                    max_repetitions: new.max_repetitions,
                });
                dirty = true;
            }
        } else if let Some(old) = iface.snmp.take() {
            strpool.release(&old.community);
            dirty = true;
        }
        if iface.main {
            interfaces_by_host_kind.insert((iface.host_id, iface.kind), id);
        } else if interfaces_by_host_kind.get(&(iface.host_id, iface.kind)) == Some(&id) {
            interfaces_by_host_kind.remove(&(iface.host_id, iface.kind));
        }
        if dirty {
            let host_id = iface.host_id;
            bump_host(hosts, proxies, host_id, rev);
            scratch.changed = true;
        }
    }

    fn remove_interface(&mut self, id: Id, rev: u64, scratch: &mut SyncScratch, unlink_host: bool) {
        let Some(iface) = self.interfaces.remove(id) else {
            return;
        };
        if self.interfaces_by_host_kind.get(&(iface.host_id, iface.kind)) == Some(&id) {
            self.interfaces_by_host_kind.remove(&(iface.host_id, iface.kind));
        }
        if unlink_host {
            if let Some(host) = self.hosts.get_mut(iface.host_id) {
                host.interfaces.retain(|&i| i != id);
            }
            bump_host(&mut self.hosts, &mut self.proxies, iface.host_id, rev);
        }
        self.strpool.release(&iface.addr);
        self.strpool.release(&iface.port);
        if let Some(snmp) = iface.snmp {
            self.strpool.release(&snmp.community);
        }
        scratch.changed = true;
    }

    fn sync_items(
        &mut self,
        rows: Vec<DiffRow<ItemRow>>,
        now: i64,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.items.contains(id) {
                        self.remove_item(id, rev, scratch, true);
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    if self.upsert_item(id, row, now, rev, scratch) {
                        applied += 1;
                    }
                }
                (tag, None) => debug!(id, ?tag, "item row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_item(
        &mut self,
        id: Id,
        row: ItemRow,
        now: i64,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> bool {
        let Self {
            items,
            hosts,
            proxies,
            interfaces,
            strpool,
            items_by_host_key,
            queues,
            ..
        } = self;
        let Some(host) = hosts.get(row.host_id) else {
            warn!(item_id = id, host_id = row.host_id, "item row references unknown host; skipped");
            return false;
        };
        let via_proxy = host.proxy_id != 0;
        let host_monitored = host.status.is_monitored();

        let (item, found) = items.find_or_create(id, |id| Item {
            id,
            host_id: row.host_id,
            kind: row.kind,
            key: strpool.intern(&row.key),
            value_kind: row.value_kind,
            delay: strpool.intern(&row.delay),
            interface_id: row.interface_id,
            status: row.status,
            poller: None,
            queue_next_check: 0,
            queue_priority: row.priority,
            location: QueueLocation::Nowhere,
            revision: rev,
            update_triggers: false,
            data_expected_from: now,
            snmp_oid: None,
            snmp_oid_kind: SnmpOidKind::Normal,
            discovery_rule: row.discovery_rule,
            master_id: 0,
            dependents: Vec::new(),
            triggers: Vec::new(),
            scheduling_error: None,
        });
        let mut flags = if found { ItemFlags::empty() } else { ItemFlags::NEW };
        let mut dirty = !found;
        if !found {
            if let Some(host) = hosts.get_mut(row.host_id) {
                host.items.push(id);
            }
            items_by_host_key
                .entry(row.host_id)
                .or_default()
                .insert(Arc::clone(&item.key), id);
            if row.interface_id != 0 {
                if let Some(iface) = interfaces.get_mut(row.interface_id) {
                    iface.items_num += 1;
                }
            }
            // a new item may carry snmp fields in the same row
        }

        // host+key is the unique key; a host change moves the item between
        // ownership lists and re-homes the key index entry
        if item.host_id != row.host_id {
            let old_host_id = item.host_id;
            if let Some(index) = items_by_host_key.get_mut(&old_host_id) {
                index.remove(&*item.key);
                if index.is_empty() {
                    items_by_host_key.remove(&old_host_id);
                }
            }
            if let Some(old_host) = hosts.get_mut(old_host_id) {
                old_host.items.retain(|&i| i != id);
            }
            bump_host(hosts, proxies, old_host_id, rev);
            if let Some(new_host) = hosts.get_mut(row.host_id) {
                new_host.items.push(id);
            }
            items_by_host_key
                .entry(row.host_id)
                .or_default()
                .insert(Arc::clone(&item.key), id);
            item.host_id = row.host_id;
            dirty = true;
        }

        if &*item.key != row.key.as_str() {
            if let Some(index) = items_by_host_key.get_mut(&item.host_id) {
                index.remove(&*item.key);
            }
            strpool.replace(&mut item.key, &row.key);
            items_by_host_key
                .entry(item.host_id)
                .or_default()
                .insert(Arc::clone(&item.key), id);
            flags |= ItemFlags::KEY_CHANGED;
        }
        if item.kind != row.kind {
            item.kind = row.kind;
            flags |= ItemFlags::TYPE_CHANGED;
        }
        if strpool.replace(&mut item.delay, &row.delay) {
            flags |= ItemFlags::DELAY_CHANGED;
        }
        if item.interface_id != row.interface_id {
            if item.interface_id != 0 {
                if let Some(old) = interfaces.get_mut(item.interface_id) {
                    old.items_num = old.items_num.saturating_sub(1);
                }
            }
            if row.interface_id != 0 {
                if let Some(new) = interfaces.get_mut(row.interface_id) {
                    new.items_num += 1;
                }
            }
            item.interface_id = row.interface_id;
            flags |= ItemFlags::INTERFACE_CHANGED;
        }
        if item.value_kind != row.value_kind {
            item.value_kind = row.value_kind;
            dirty = true;
        }
        if item.status != row.status {
            item.status = row.status;
            dirty = true;
        }
        if item.queue_priority != row.priority {
            item.queue_priority = row.priority;
            dirty = true;
        }
        if item.discovery_rule != row.discovery_rule {
            item.discovery_rule = row.discovery_rule;
            flags |= ItemFlags::TYPE_CHANGED;
        }
        if strpool.replace_opt(&mut item.snmp_oid, row.snmp_oid.as_deref()) {
            item.snmp_oid_kind = item
                .snmp_oid
                .as_deref()
                .map(SnmpOidKind::classify)
                .unwrap_or_default();
            flags |= ItemFlags::TYPE_CHANGED;
        }
        let master_change =
            (item.master_id != row.master_id).then_some((item.master_id, row.master_id));
        if master_change.is_some() {
            item.master_id = row.master_id;
            dirty = true;
        }

        let class = poller_class(row.kind, &item.key, via_proxy);
        if item.poller != class {
            if item.location == QueueLocation::Queue {
                queues.drop_item(id);
                item.location = QueueLocation::Nowhere;
            }
            item.poller = class;
            dirty = true;
        }
        dirty |= !flags.is_empty();

        let schedulable =
            host_monitored && item.status == MonitoredStatus::Active && class.is_some();
        if let Some(class) = class.filter(|_| schedulable) {
            let iface = interfaces.get(item.interface_id);
            if item_nextcheck_update(item, iface, flags, now, strpool)
                && item.location != QueueLocation::Poller
            {
                queues.enqueue_item(
                    class,
                    id,
                    PollerKey::new(item.queue_next_check, item.queue_priority, batch_tiebreak(class, item)),
                );
                item.location = QueueLocation::Queue;
            } else if item.queue_next_check == crate::model::NEVER {
                queues.drop_item(id);
                item.location = QueueLocation::Nowhere;
            }
        } else {
            if item.location == QueueLocation::Queue {
                queues.drop_item(id);
            }
            item.location = QueueLocation::Nowhere;
        }

        if dirty {
            item.revision = rev;
            scratch.changed = true;
            bump_host(hosts, proxies, row.host_id, rev);
        }

        if let Some((old_master, new_master)) = master_change {
            if old_master != 0 {
                if let Some(master) = items.get_mut(old_master) {
                    master.dependents.retain(|&d| d != id);
                }
            }
            if new_master != 0 {
                if let Some(master) = items.get_mut(new_master) {
                    master.dependents.push(id);
                }
            }
        }
        true
    }

    fn remove_item(&mut self, id: Id, rev: u64, scratch: &mut SyncScratch, unlink_host: bool) {
        let Some(item) = self.items.remove(id) else {
            return;
        };
        self.queues.drop_item(id);
        if let Some(index) = self.items_by_host_key.get_mut(&item.host_id) {
            index.remove(&*item.key);
            if index.is_empty() {
                self.items_by_host_key.remove(&item.host_id);
            }
        }
        if unlink_host {
            if let Some(host) = self.hosts.get_mut(item.host_id) {
                host.items.retain(|&i| i != id);
            }
            bump_host(&mut self.hosts, &mut self.proxies, item.host_id, rev);
        }
        if item.interface_id != 0 {
            if let Some(iface) = self.interfaces.get_mut(item.interface_id) {
                iface.items_num = iface.items_num.saturating_sub(1);
            }
        }
        if item.master_id != 0 {
            if let Some(master) = self.items.get_mut(item.master_id) {
                master.dependents.retain(|&d| d != id);
            }
        }
        for &dep_id in &item.dependents {
            if let Some(dep) = self.items.get_mut(dep_id) {
                dep.master_id = 0;
            }
        }
        for &trigger_id in &item.triggers {
            scratch.dirty_triggers.insert(trigger_id);
            if let Some(trig) = self.triggers.get_mut(trigger_id) {
                trig.item_ids.retain(|&i| i != id);
            }
        }
        self.strpool.release(&item.key);
        self.strpool.release(&item.delay);
        self.strpool.release_opt(item.snmp_oid.as_ref());
        self.strpool.release_opt(item.scheduling_error.as_ref());
        scratch.changed = true;
    }

    fn sync_functions(
        &mut self,
        rows: Vec<DiffRow<FunctionRow>>,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.functions.contains(id) {
                        self.remove_function(id, scratch);
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    self.upsert_function(id, row, rev, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "function row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_function(&mut self, id: Id, row: FunctionRow, rev: u64, scratch: &mut SyncScratch) {
        let Self {
            functions,
            triggers,
            items,
            strpool,
            ..
        } = self;
        let (func, found) = functions.find_or_create(id, |id| Function {
            id,
            trigger_id: row.trigger_id,
            item_id: row.item_id,
            name: strpool.intern(&row.name),
            parameter: strpool.intern(&row.parameter),
            kind: FunctionKind::classify(&row.name),
            revision: rev,
            timer_revision: 0,
        });
        let mut dirty = !found;
        if !found {
            if let Some(trig) = triggers.get_mut(row.trigger_id) {
                trig.functions.push(id);
            } else {
                // trigger row arrives later this cycle
                scratch.pending_links.push((row.trigger_id, id));
            }
            scratch.dirty_triggers.insert(row.trigger_id);
            if let Some(item) = items.get_mut(row.item_id) {
                item.update_triggers = true;
            }
        }
        if strpool.replace(&mut func.name, &row.name) {
            func.kind = FunctionKind::classify(&row.name);
            dirty = true;
        }
        dirty |= strpool.replace(&mut func.parameter, &row.parameter);
        if func.trigger_id != row.trigger_id {
            if let Some(old) = triggers.get_mut(func.trigger_id) {
                old.functions.retain(|&f| f != id);
            }
            scratch.dirty_triggers.insert(func.trigger_id);
            if let Some(new) = triggers.get_mut(row.trigger_id) {
                new.functions.push(id);
            } else {
                scratch.pending_links.push((row.trigger_id, id));
            }
            scratch.dirty_triggers.insert(row.trigger_id);
            func.trigger_id = row.trigger_id;
            dirty = true;
        }
        if func.item_id != row.item_id {
            if let Some(old) = items.get_mut(func.item_id) {
                old.update_triggers = true;
            }
            if let Some(new) = items.get_mut(row.item_id) {
                new.update_triggers = true;
            }
            func.item_id = row.item_id;
            scratch.dirty_triggers.insert(func.trigger_id);
            dirty = true;
        }
        if dirty {
            func.revision = rev;
            scratch.dirty_triggers.insert(func.trigger_id);
            if let Some(trig) = triggers.get_mut(func.trigger_id) {
                trig.revision = rev;
            }
            scratch.changed = true;
        }
    }

    fn remove_function(&mut self, id: Id, scratch: &mut SyncScratch) {
        let Some(func) = self.functions.remove(id) else {
            return;
        };
        if let Some(trig) = self.triggers.get_mut(func.trigger_id) {
            trig.functions.retain(|&f| f != id);
        }
        scratch.dirty_triggers.insert(func.trigger_id);
        if let Some(item) = self.items.get_mut(func.item_id) {
            item.update_triggers = true;
        }
        self.strpool.release(&func.name);
        self.strpool.release(&func.parameter);
        scratch.changed = true;
    }

    fn sync_triggers(
        &mut self,
        rows: Vec<DiffRow<TriggerRow>>,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.triggers.contains(id) {
                        self.remove_trigger(id, scratch);
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    self.upsert_trigger(id, row, rev, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "trigger row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_trigger(&mut self, id: Id, row: TriggerRow, rev: u64, scratch: &mut SyncScratch) {
        let (trig, found) = self.triggers.find_or_create(id, |id| Trigger {
            id,
            status: row.status,
            timer: row.timer,
            revision: rev,
            timer_revision: 0,
            functions: Vec::new(),
            item_ids: Vec::new(),
            deps_up: Vec::new(),
            deps_down: Vec::new(),
        });
        let mut dirty = !found;
        if trig.status != row.status {
            trig.status = row.status;
            dirty = true;
        }
        if trig.timer != row.timer {
            trig.timer = row.timer;
            dirty = true;
        }
        if dirty {
            trig.revision = rev;
            scratch.dirty_triggers.insert(id);
            scratch.changed = true;
        }
    }

    fn remove_trigger(&mut self, id: Id, scratch: &mut SyncScratch) {
        let Some(trig) = self.triggers.remove(id) else {
            return;
        };
        self.queues.trigger_timers.remove(id);
        for &item_id in &trig.item_ids {
            if let Some(item) = self.items.get_mut(item_id) {
                item.triggers.retain(|&t| t != id);
            }
        }
        for &up in &trig.deps_up {
            if let Some(other) = self.triggers.get_mut(up) {
                other.deps_down.retain(|&t| t != id);
            }
        }
        for &down in &trig.deps_down {
            if let Some(other) = self.triggers.get_mut(down) {
                other.deps_up.retain(|&t| t != id);
            }
        }
        scratch.dirty_triggers.remove(&id);
        scratch.changed = true;
    }

    fn sync_trigger_deps(
        &mut self,
        rows: Vec<DiffRow<TriggerDepRow>>,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if let Some(dep) = self.trigger_deps.remove(id) {
                        unlink_dep_edge(&mut self.triggers, dep.trigger_id, dep.depends_on);
                        scratch.changed = true;
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    self.upsert_trigger_dep(id, row, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "dependency row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_trigger_dep(&mut self, id: Id, row: TriggerDepRow, scratch: &mut SyncScratch) {
        let (dep, found) = self.trigger_deps.find_or_create(id, |id| TriggerDep {
            id,
            trigger_id: row.trigger_id,
            depends_on: row.depends_on,
        });
        let moved = found && (dep.trigger_id != row.trigger_id || dep.depends_on != row.depends_on);
        let old_edge = moved.then_some((dep.trigger_id, dep.depends_on));
        dep.trigger_id = row.trigger_id;
        dep.depends_on = row.depends_on;
        if let Some((old_trigger, old_depends_on)) = old_edge {
            unlink_dep_edge(&mut self.triggers, old_trigger, old_depends_on);
        }
        if !found || moved {
            link_dep_edge(&mut self.triggers, row.trigger_id, row.depends_on);
            scratch.changed = true;
        }
    }

    fn sync_drules(
        &mut self,
        rows: Vec<DiffRow<DruleRow>>,
        now: i64,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.drules.remove(id).is_some() {
                        self.queues.drules.remove(id);
                        scratch.changed = true;
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    self.upsert_drule(id, row, now, rev, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "discovery rule row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_drule(&mut self, id: Id, row: DruleRow, now: i64, rev: u64, scratch: &mut SyncScratch) {
        let (rule, found) = self.drules.find_or_create(id, |id| DiscoveryRule {
            id,
            proxy_id: row.proxy_id,
            delay: row.delay,
            status: row.status,
            next_check: 0,
            location: QueueLocation::Nowhere,
            revision: rev,
        });
        let mut dirty = !found;
        if rule.proxy_id != row.proxy_id {
            rule.proxy_id = row.proxy_id;
            dirty = true;
        }
        if rule.delay != row.delay {
            rule.delay = row.delay;
            dirty = true;
        }
        if rule.status != row.status {
            rule.status = row.status;
            dirty = true;
        }
        if dirty {
            rule.revision = rev;
            scratch.changed = true;
        }
        let local = rule.status == MonitoredStatus::Active && rule.proxy_id == 0 && rule.delay > 0;
        if local && (dirty || rule.location == QueueLocation::Nowhere) {
            rule.next_check = spread_nextcheck(id, rule.delay, now);
            self.queues.drules.push(id, rule.next_check);
            rule.location = QueueLocation::Queue;
        } else if !local {
            self.queues.drules.remove(id);
            rule.location = QueueLocation::Nowhere;
        }
        if dirty {
            let proxy_id = rule.proxy_id;
            bump_proxy(&mut self.proxies, proxy_id, rev);
        }
    }

    fn sync_web_tests(
        &mut self,
        rows: Vec<DiffRow<WebTestRow>>,
        now: i64,
        rev: u64,
        scratch: &mut SyncScratch,
    ) -> usize {
        let mut applied = 0;
        for DiffRow { id, tag, row } in rows {
            match (tag, row) {
                (DiffTag::Remove, _) => {
                    if self.web_tests.contains(id) {
                        self.remove_web_test(id, rev, scratch, true);
                        applied += 1;
                    }
                }
                (_, Some(row)) => {
                    self.upsert_web_test(id, row, now, rev, scratch);
                    applied += 1;
                }
                (tag, None) => debug!(id, ?tag, "web test row without payload skipped"),
            }
        }
        applied
    }

    fn upsert_web_test(
        &mut self,
        id: Id,
        row: WebTestRow,
        now: i64,
        rev: u64,
        scratch: &mut SyncScratch,
    ) {
        let (wt, found) = self.web_tests.find_or_create(id, |id| WebTest {
            id,
            host_id: row.host_id,
            delay: row.delay,
            status: row.status,
            next_check: 0,
            location: QueueLocation::Nowhere,
            revision: rev,
        });
        let mut dirty = !found;
        if !found {
            if let Some(host) = self.hosts.get_mut(row.host_id) {
                host.web_tests.push(id);
            }
        }
        if wt.host_id != row.host_id {
            if let Some(old) = self.hosts.get_mut(wt.host_id) {
                old.web_tests.retain(|&w| w != id);
            }
            if let Some(new) = self.hosts.get_mut(row.host_id) {
                new.web_tests.push(id);
            }
            wt.host_id = row.host_id;
            dirty = true;
        }
        if wt.delay != row.delay {
            wt.delay = row.delay;
            dirty = true;
        }
        if wt.status != row.status {
            wt.status = row.status;
            dirty = true;
        }
        if dirty {
            wt.revision = rev;
            scratch.changed = true;
        }
        let host = self.hosts.get(wt.host_id);
        let local = wt.status == MonitoredStatus::Active
            && wt.delay > 0
            && host.is_some_and(|h| h.status.is_monitored() && h.proxy_id == 0);
        if local && (dirty || wt.location == QueueLocation::Nowhere) {
            wt.next_check = spread_nextcheck(id, wt.delay, now);
            self.queues.web_tests.push(id, wt.next_check);
            wt.location = QueueLocation::Queue;
        } else if !local {
            self.queues.web_tests.remove(id);
            wt.location = QueueLocation::Nowhere;
        }
        if dirty {
            let host_id = wt.host_id;
            bump_host(&mut self.hosts, &mut self.proxies, host_id, rev);
        }
    }

    fn remove_web_test(&mut self, id: Id, rev: u64, scratch: &mut SyncScratch, unlink_host: bool) {
        let Some(wt) = self.web_tests.remove(id) else {
            return;
        };
        self.queues.web_tests.remove(id);
        if unlink_host {
            if let Some(host) = self.hosts.get_mut(wt.host_id) {
                host.web_tests.retain(|&w| w != id);
            }
            bump_host(&mut self.hosts, &mut self.proxies, wt.host_id, rev);
        }
        scratch.changed = true;
    }

    /// Post-merge pass: attach deferred function links and rebuild the
    /// item back-links of every trigger touched this cycle.
    fn relink_triggers(&mut self, scratch: &mut SyncScratch) {
        let Self {
            triggers,
            functions,
            items,
            ..
        } = self;
        for (trigger_id, function_id) in scratch.pending_links.drain(..) {
            let Some(func) = functions.get(function_id) else {
                continue;
            };
            if func.trigger_id != trigger_id {
                continue;
            }
            if let Some(trig) = triggers.get_mut(trigger_id) {
                if !trig.functions.contains(&function_id) {
                    trig.functions.push(function_id);
                }
            }
        }
        for &trigger_id in &scratch.dirty_triggers {
            let Some(trig) = triggers.get_mut(trigger_id) else {
                continue;
            };
            let old_items = std::mem::take(&mut trig.item_ids);
            let mut new_items: Vec<Id> = Vec::new();
            for &function_id in &trig.functions {
                if let Some(func) = functions.get(function_id) {
                    if items.contains(func.item_id) && !new_items.contains(&func.item_id) {
                        new_items.push(func.item_id);
                    }
                }
            }
            for &item_id in &old_items {
                if let Some(item) = items.get_mut(item_id) {
                    item.triggers.retain(|&t| t != trigger_id);
                    item.update_triggers = false;
                }
            }
            for &item_id in &new_items {
                if let Some(item) = items.get_mut(item_id) {
                    if !item.triggers.contains(&trigger_id) {
                        item.triggers.push(trigger_id);
                    }
                    item.update_triggers = false;
                }
            }
            trig.item_ids = new_items;
        }
    }

    /// Queue an evaluation slot for every active trigger with time-based
    /// parts whose timer lags behind its revision. Slots land on the next
    /// whole minute.
    fn schedule_trigger_timers(&mut self, now: i64) {
        let Self {
            triggers,
            functions,
            queues,
            ..
        } = self;
        for (id, trig) in triggers.iter_mut() {
            if trig.status != MonitoredStatus::Active {
                queues.trigger_timers.remove(id);
                continue;
            }
            let time_based = !trig.timer.is_empty()
                || trig.functions.iter().any(|&f| {
                    functions
                        .get(f)
                        .is_some_and(|func| func.kind == FunctionKind::TimeBased)
                });
            if !time_based {
                queues.trigger_timers.remove(id);
                trig.timer_revision = trig.revision;
                continue;
            }
            if trig.timer_revision >= trig.revision {
                continue;
            }
            let eval_at = (now / 60 + 1) * 60;
            queues.trigger_timers.push(id, (eval_at, id));
            trig.timer_revision = trig.revision;
        }
    }
}
