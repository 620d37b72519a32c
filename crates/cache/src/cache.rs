#![forbid(unsafe_code)]

use crate::avail::{AvailabilityTracker, InterfaceIdent, Pollability};
use crate::diff::ConfigSource;
use crate::error::Error;
use crate::model::{
    Id, ItemFlags, ItemKind, MonitoredStatus, PollerClass, ProxyMode, QueueLocation, QueuePriority,
    ValueKind, NEVER,
};
use crate::nextcheck::spread_nextcheck;
use crate::sched::{
    batch_tiebreak, item_nextcheck_update, item_unreachable_nextcheck, poller_class, PollerKey,
    PollerStats, Tiebreak,
};
use crate::strpool::StrRef;
use crate::sync::{CacheState, FetchedBatch, SyncReport};
use config::Config;
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything a poller needs to run one check, snapshotted out of the
/// cache so no lock is held while probing.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub item_id: Id,
    pub host_id: Id,
    pub kind: ItemKind,
    pub key: StrRef,
    pub value_kind: ValueKind,
    pub interface_id: Id,
    pub addr: Option<StrRef>,
    pub port: Option<StrRef>,
    pub snmp_oid: Option<StrRef>,
    pub snmp_community: Option<StrRef>,
    pub snmp_bulk: bool,
    pub snmp_max_repetitions: i32,
}

/// What a poller reports back for each item it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// A value was collected; reschedule from the poll clock.
    Collected,
    /// The probe failed at the network layer; back off on the ladder.
    Unreachable,
    /// The poller gave the item back untouched.
    Skipped,
}

/// One overdue entry of the queue diagnostics view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub item_id: Id,
    pub class: PollerClass,
    pub next_check: i64,
}

/// Table and pool sizes for the diagnostics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub revision: u64,
    pub hosts: usize,
    pub proxies: usize,
    pub interfaces: usize,
    pub items: usize,
    pub triggers: usize,
    pub functions: usize,
    pub interned_strings: usize,
    pub queued_items: usize,
}

/// The in-process configuration cache.
///
/// One instance per server. All configuration state sits behind a single
/// `parking_lot` RwLock; the hot poller counters and the availability
/// tracker carry their own locks so dispatch accounting and pollability
/// verdicts never wait on a running sync cycle.
#[derive(Debug)]
pub struct ConfigCache {
    state: RwLock<CacheState>,
    stats: RwLock<PollerStats>,
    avail: AvailabilityTracker,
    config: Config,
}

impl ConfigCache {
    pub fn new(config: Config) -> Self {
        let unreachable_delay = config.unreachable.delay.as_secs() as i64;
        Self {
            state: RwLock::new(CacheState::default()),
            stats: RwLock::new(PollerStats::default()),
            avail: AvailabilityTracker::new(unreachable_delay),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn availability(&self) -> &AvailabilityTracker {
        &self.avail
    }

    /// Run one sync cycle against `source`.
    ///
    /// All eight diff streams are fetched before the write lock is taken;
    /// a fetch failure aborts the cycle and the committed snapshot stays
    /// authoritative. Re-running a cycle whose rows are already applied
    /// changes nothing and leaves the revision alone.
    pub fn sync(&self, source: &mut dyn ConfigSource, now: i64) -> Result<SyncReport, Error> {
        let _span = tracing::debug_span!("sync_cycle", now).entered();
        let batch = FetchedBatch::fetch(source)?;
        let (report, scratch) = {
            let mut state = self.state.write();
            state.apply(batch, now)
        };
        // availability side effects run outside the cache lock
        for &host_id in &scratch.reset_hosts {
            self.avail.reset(host_id, now);
        }
        for &host_id in &scratch.removed_hosts {
            self.avail.remove(host_id);
        }
        Ok(report)
    }

    /// Committed cache revision.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn host_revision(&self, host_id: Id) -> Result<u64, Error> {
        let state = self.state.read();
        state
            .hosts
            .get(host_id)
            .map(|host| host.revision)
            .ok_or(Error::UnknownHost(host_id))
    }

    pub fn proxy_revision(&self, proxy_id: Id) -> Result<u64, Error> {
        let state = self.state.read();
        state
            .proxies
            .get(proxy_id)
            .map(|proxy| proxy.revision)
            .ok_or(Error::UnknownProxy(proxy_id))
    }

    pub fn item_revision(&self, item_id: Id) -> Result<u64, Error> {
        let state = self.state.read();
        state
            .items
            .get(item_id)
            .map(|item| item.revision)
            .ok_or(Error::UnknownItem(item_id))
    }

    /// Resolve a host by its technical name.
    pub fn find_host_id(&self, name: &str) -> Option<Id> {
        self.state.read().hosts_by_name.get(name).copied()
    }

    /// Resolve an item by host name and item key.
    pub fn find_item_id(&self, host: &str, key: &str) -> Option<Id> {
        let state = self.state.read();
        let host_id = state.hosts_by_name.get(host)?;
        state.items_by_host_key.get(host_id)?.get(key).copied()
    }

    /// Main interface of `kind` on a host.
    pub fn find_main_interface(
        &self,
        host_id: Id,
        kind: crate::model::InterfaceKind,
    ) -> Option<Id> {
        self.state
            .read()
            .interfaces_by_host_kind
            .get(&(host_id, kind))
            .copied()
    }

    pub fn item_nextcheck(&self, item_id: Id) -> Result<i64, Error> {
        let state = self.state.read();
        state
            .items
            .get(item_id)
            .map(|item| item.queue_next_check)
            .ok_or(Error::UnknownItem(item_id))
    }

    /// Last interval-parse failure for an item, if any.
    pub fn item_scheduling_error(&self, item_id: Id) -> Result<Option<String>, Error> {
        let state = self.state.read();
        state
            .items
            .get(item_id)
            .map(|item| item.scheduling_error.as_deref().map(str::to_string))
            .ok_or(Error::UnknownItem(item_id))
    }

    fn batch_limit(&self, class: PollerClass) -> usize {
        match class {
            PollerClass::Snmp => self.config.poller.max_snmp_items,
            PollerClass::Java => self.config.poller.max_java_items,
            PollerClass::Pinger => self.config.poller.max_pinger_items,
            _ => 1,
        }
    }

    /// Dequeue the next batch of due items for one poller class.
    ///
    /// Batches never exceed the configured class ceiling, and for SNMP and
    /// Java never mix tiebreaks, so everything handed out can go into one
    /// bulk request. Items on hosts in a no-data maintenance window are
    /// requeued without being handed out, and items whose interface sits in
    /// unreachable backoff migrate to the unreachable queue.
    pub fn get_poller_items(&self, class: PollerClass, now: i64) -> Vec<PollRequest> {
        let limit = self.batch_limit(class);
        let mut out = Vec::new();
        {
            let mut state = self.state.write();
            let CacheState {
                items,
                hosts,
                interfaces,
                queues,
                strpool,
                ..
            } = &mut *state;
            let mut batch_mark: Option<Tiebreak> = None;
            while out.len() < limit {
                let Some((key, item_id)) = queues.poller(class).peek() else {
                    break;
                };
                if key.next_check > now {
                    break;
                }
                if class.batches_by_tiebreak() {
                    match batch_mark {
                        Some(mark) if mark != key.tiebreak => break,
                        None => batch_mark = Some(key.tiebreak),
                        _ => {}
                    }
                }
                queues.poller_mut(class).pop();

                let Some(item) = items.get_mut(item_id) else {
                    continue;
                };
                if item.poller != Some(class) || item.status != MonitoredStatus::Active {
                    item.location = QueueLocation::Nowhere;
                    continue;
                }
                let Some(host) = hosts.get(item.host_id) else {
                    item.location = QueueLocation::Nowhere;
                    continue;
                };
                if !host.status.is_monitored() || host.proxy_id != 0 {
                    item.location = QueueLocation::Nowhere;
                    continue;
                }
                if host.in_no_data_maintenance() {
                    // silently roll past the window; picked up again next due
                    let iface = interfaces.get(item.interface_id);
                    if item_nextcheck_update(item, iface, ItemFlags::COLLECTED, now, strpool) {
                        queues.enqueue_item(
                            class,
                            item_id,
                            PollerKey::new(
                                item.queue_next_check,
                                item.queue_priority,
                                batch_tiebreak(class, item),
                            ),
                        );
                        item.location = QueueLocation::Queue;
                    } else {
                        item.location = QueueLocation::Nowhere;
                    }
                    continue;
                }
                if item.interface_id != 0 && item.queue_priority != QueuePriority::High {
                    let ident = InterfaceIdent::Id(item.interface_id);
                    if let Pollability::Blocked { disabled_until } =
                        self.avail.is_pollable(item.host_id, &ident, now)
                    {
                        let target = match class {
                            PollerClass::Normal | PollerClass::Java => PollerClass::Unreachable,
                            other => other,
                        };
                        item.poller = Some(target);
                        item.queue_next_check = disabled_until;
                        queues.enqueue_item(
                            target,
                            item_id,
                            PollerKey::new(
                                disabled_until,
                                item.queue_priority,
                                batch_tiebreak(target, item),
                            ),
                        );
                        item.location = QueueLocation::Queue;
                        debug!(item_id, ?target, "interface unreachable; item deferred");
                        continue;
                    }
                }

                item.location = QueueLocation::Poller;
                let iface = interfaces.get(item.interface_id);
                out.push(PollRequest {
                    item_id,
                    host_id: item.host_id,
                    kind: item.kind,
                    key: item.key.clone(),
                    value_kind: item.value_kind,
                    interface_id: item.interface_id,
                    addr: iface.map(|i| i.addr.clone()),
                    port: iface.map(|i| i.port.clone()),
                    snmp_oid: item.snmp_oid.clone(),
                    snmp_community: iface.and_then(|i| i.snmp.as_ref()).map(|s| s.community.clone()),
                    snmp_bulk: iface.is_none_or(|i| i.bulk_enabled()),
                    snmp_max_repetitions: iface
                        .and_then(|i| i.snmp.as_ref())
                        .map(|s| s.max_repetitions)
                        .unwrap_or(0),
                });
            }
        }
        if !out.is_empty() {
            self.stats.write().note_dispatched(class, out.len());
        }
        out
    }

    /// Return polled items to their queues according to the verdicts.
    pub fn requeue_items(&self, verdicts: &[(Id, PollVerdict)], now: i64) {
        let ladder_delay = self.config.unreachable.delay.as_secs() as i64;
        let ladder_period = self.config.unreachable.period.as_secs() as i64;
        let mut returned = [0usize; PollerClass::COUNT];
        {
            let mut state = self.state.write();
            let CacheState {
                items,
                hosts,
                interfaces,
                queues,
                strpool,
                ..
            } = &mut *state;
            for &(item_id, verdict) in verdicts {
                let Some(item) = items.get_mut(item_id) else {
                    warn!(item_id, "requeue for unknown item ignored");
                    continue;
                };
                if let Some(class) = item.poller {
                    returned[class.index()] += 1;
                }
                let Some(host) = hosts.get(item.host_id) else {
                    item.location = QueueLocation::Nowhere;
                    continue;
                };
                let natural = poller_class(item.kind, &item.key, host.proxy_id != 0);
                let Some(natural) = natural.filter(|_| {
                    host.status.is_monitored() && item.status == MonitoredStatus::Active
                }) else {
                    item.location = QueueLocation::Nowhere;
                    continue;
                };
                match verdict {
                    PollVerdict::Collected | PollVerdict::Skipped => {
                        item.poller = Some(natural);
                        let flags = if verdict == PollVerdict::Collected {
                            ItemFlags::COLLECTED
                        } else {
                            ItemFlags::empty()
                        };
                        let iface = interfaces.get(item.interface_id);
                        if item_nextcheck_update(item, iface, flags, now, strpool) {
                            queues.enqueue_item(
                                natural,
                                item_id,
                                PollerKey::new(
                                    item.queue_next_check,
                                    item.queue_priority,
                                    batch_tiebreak(natural, item),
                                ),
                            );
                            item.location = QueueLocation::Queue;
                        } else {
                            item.location = QueueLocation::Nowhere;
                        }
                    }
                    PollVerdict::Unreachable => {
                        let ident = InterfaceIdent::Id(item.interface_id);
                        let (fails, disabled_until) = self
                            .avail
                            .interface_backoff(item.host_id, &ident)
                            .unwrap_or((1, 0));
                        item_unreachable_nextcheck(
                            item,
                            fails,
                            disabled_until,
                            now,
                            ladder_delay,
                            ladder_period,
                        );
                        let target = match natural {
                            PollerClass::Normal | PollerClass::Java => PollerClass::Unreachable,
                            other => other,
                        };
                        item.poller = Some(target);
                        queues.enqueue_item(
                            target,
                            item_id,
                            PollerKey::new(
                                item.queue_next_check,
                                item.queue_priority,
                                batch_tiebreak(target, item),
                            ),
                        );
                        item.location = QueueLocation::Queue;
                    }
                }
            }
        }
        let mut stats = self.stats.write();
        for class in PollerClass::ALL {
            let count = returned[class.index()];
            if count > 0 {
                stats.note_returned(class, count);
            }
        }
    }

    /// Items overdue by at least `from` (defaults to the configured
    /// diagnostics window), sorted oldest first. Parked items never show.
    pub fn get_item_queue(&self, from: Option<Duration>, now: i64) -> Vec<QueueEntry> {
        let from = from.unwrap_or(self.config.poller.queue_from).as_secs() as i64;
        let state = self.state.read();
        let mut out = Vec::new();
        for class in PollerClass::ALL {
            for (key, item_id) in state.queues.poller(class).iter() {
                if key.next_check != NEVER && now - key.next_check >= from {
                    out.push(QueueEntry {
                        item_id,
                        class,
                        next_check: key.next_check,
                    });
                }
            }
        }
        out.sort_by_key(|entry| (entry.next_check, entry.item_id));
        out
    }

    /// Pop due passive proxies, marking them handed out.
    pub fn get_proxy_pollers(&self, now: i64, limit: usize) -> Vec<Id> {
        let mut state = self.state.write();
        let mut out = Vec::new();
        while out.len() < limit {
            let Some((&next_check, proxy_id)) = state.queues.proxies.peek() else {
                break;
            };
            if next_check > now {
                break;
            }
            state.queues.proxies.pop();
            if let Some(proxy) = state.proxies.get_mut(proxy_id) {
                proxy.location = QueueLocation::Poller;
                out.push(proxy_id);
            }
        }
        out
    }

    /// Return a polled proxy with its refreshed schedule.
    pub fn requeue_proxy(
        &self,
        proxy_id: Id,
        config_next_check: i64,
        data_next_check: i64,
        task_next_check: i64,
    ) -> Result<(), Error> {
        let mut state = self.state.write();
        let CacheState {
            proxies, queues, ..
        } = &mut *state;
        let proxy = proxies
            .get_mut(proxy_id)
            .ok_or(Error::UnknownProxy(proxy_id))?;
        proxy.config_next_check = config_next_check;
        proxy.data_next_check = data_next_check;
        proxy.task_next_check = task_next_check;
        // the proxy may have turned active while it was out at a poller
        match proxy.mode {
            ProxyMode::Passive => {
                queues.proxies.push(proxy_id, proxy.nextcheck());
                proxy.location = QueueLocation::Queue;
            }
            ProxyMode::Active => proxy.location = QueueLocation::Nowhere,
        }
        Ok(())
    }

    /// Record that an active proxy connected.
    pub fn proxy_touch(&self, proxy_id: Id, now: i64) -> Result<(), Error> {
        let mut state = self.state.write();
        let proxy = state
            .proxies
            .get_mut(proxy_id)
            .ok_or(Error::UnknownProxy(proxy_id))?;
        proxy.last_access = now;
        Ok(())
    }

    /// Pop due trigger timer slots; each popped trigger is rescheduled on
    /// the following minute so time-based expressions keep evaluating.
    pub fn pop_trigger_timers(&self, now: i64, limit: usize) -> Vec<(Id, i64)> {
        let mut state = self.state.write();
        let mut out = Vec::new();
        while out.len() < limit {
            let Some((&(eval_at, _), trigger_id)) = state.queues.trigger_timers.peek() else {
                break;
            };
            if eval_at > now {
                break;
            }
            state.queues.trigger_timers.pop();
            out.push((trigger_id, eval_at));
            let next = (now / 60 + 1) * 60;
            state.queues.trigger_timers.push(trigger_id, (next, trigger_id));
        }
        out
    }

    /// Pop due discovery rules; each is immediately respread on its own
    /// interval.
    pub fn pop_due_discovery_checks(&self, now: i64) -> Vec<Id> {
        let mut state = self.state.write();
        let CacheState { drules, queues, .. } = &mut *state;
        let mut out = Vec::new();
        loop {
            let Some((&next_check, rule_id)) = queues.drules.peek() else {
                break;
            };
            if next_check > now {
                break;
            }
            queues.drules.pop();
            if let Some(rule) = drules.get_mut(rule_id) {
                rule.next_check = spread_nextcheck(rule_id, rule.delay.max(1), now);
                queues.drules.push(rule_id, rule.next_check);
                out.push(rule_id);
            }
        }
        out
    }

    /// Pop due web tests; each is immediately respread on its own interval.
    pub fn pop_due_web_tests(&self, now: i64) -> Vec<Id> {
        let mut state = self.state.write();
        let CacheState {
            web_tests, queues, ..
        } = &mut *state;
        let mut out = Vec::new();
        loop {
            let Some((&next_check, wt_id)) = queues.web_tests.peek() else {
                break;
            };
            if next_check > now {
                break;
            }
            queues.web_tests.pop();
            if let Some(wt) = web_tests.get_mut(wt_id) {
                wt.next_check = spread_nextcheck(wt_id, wt.delay.max(1), now);
                queues.web_tests.push(wt_id, wt.next_check);
                out.push(wt_id);
            }
        }
        out
    }

    /// Dispatch accounting for one class: total handed out and currently
    /// in flight.
    pub fn poller_activity(&self, class: PollerClass) -> (u64, usize) {
        let stats = self.stats.read();
        (stats.handed_out(class), stats.in_flight(class))
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        let queued_items = PollerClass::ALL
            .iter()
            .map(|&class| state.queues.queued_items(class))
            .sum();
        CacheStats {
            revision: state.revision,
            hosts: state.hosts.len(),
            proxies: state.proxies.len(),
            interfaces: state.interfaces.len(),
            items: state.items.len(),
            triggers: state.triggers.len(),
            functions: state.functions.len(),
            interned_strings: state.strpool.len(),
            queued_items,
        }
    }
}
