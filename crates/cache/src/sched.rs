#![forbid(unsafe_code)]

use crate::model::{
    Id, Interface, Item, ItemFlags, ItemKind, PollerClass, QueuePriority, NEVER,
};
use crate::nextcheck::{self, is_ping_key};
use crate::pqueue::IndexedHeap;
use crate::strpool::StrPool;
use tracing::trace;

/// Batch tiebreak: entries sharing a tiebreak may travel in one poller
/// batch. For SNMP the OID shape and discovery flag split the batch so a
/// bulk request never mixes walk or discovery items with plain gets.
pub type Tiebreak = (u64, u8, u8);

/// Heap key for the per-class item queues. Field order is the sort order:
/// due time first, then priority among entries due together, then the
/// batch tiebreak so batchable entries come out adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PollerKey {
    pub next_check: i64,
    pub priority: u8,
    pub tiebreak: Tiebreak,
}

impl PollerKey {
    pub fn new(next_check: i64, priority: QueuePriority, tiebreak: Tiebreak) -> Self {
        Self {
            next_check,
            priority: priority.rank(),
            tiebreak,
        }
    }
}

/// Decide which poller class serves an item, `None` for items that are
/// never queued: passive rows behind a proxy, trapper and dependent items.
pub fn poller_class(kind: ItemKind, key: &str, via_proxy: bool) -> Option<PollerClass> {
    if via_proxy {
        return None;
    }
    match kind {
        ItemKind::Agent | ItemKind::Internal | ItemKind::Calculated | ItemKind::Script => {
            Some(PollerClass::Normal)
        }
        ItemKind::Simple => {
            if is_ping_key(key) {
                Some(PollerClass::Pinger)
            } else {
                Some(PollerClass::Normal)
            }
        }
        ItemKind::SnmpAgent => Some(PollerClass::Snmp),
        ItemKind::Ipmi => Some(PollerClass::Ipmi),
        ItemKind::Jmx => Some(PollerClass::Java),
        ItemKind::Trapper | ItemKind::Dependent => None,
    }
}

/// Batch tiebreak for an item in its class. Classes that dequeue one item
/// at a time get a constant tiebreak.
pub fn batch_tiebreak(class: PollerClass, item: &Item) -> Tiebreak {
    match class {
        PollerClass::Snmp => (
            item.interface_id,
            u8::from(item.discovery_rule),
            item.snmp_oid_kind.rank(),
        ),
        PollerClass::Java | PollerClass::Pinger => (item.interface_id, 0, 0),
        _ => (0, 0, 0),
    }
}

/// Recompute `item.queue_next_check` with the spread formula.
///
/// Only runs when the merge flags demand it; an untouched item keeps its
/// queue position. A broken interval parks the item on [`NEVER`] with the
/// parse failure recorded, and returns false.
pub fn item_nextcheck_update(
    item: &mut Item,
    interface: Option<&Interface>,
    flags: ItemFlags,
    now: i64,
    strpool: &mut StrPool,
) -> bool {
    if !flags.needs_reschedule() {
        return item.queue_next_check != NEVER;
    }

    let delay = match nextcheck::parse_delay(&item.delay) {
        Ok(delay) => delay,
        Err(err) => {
            strpool.replace_opt(&mut item.scheduling_error, Some(&err.to_string()));
            item.queue_next_check = NEVER;
            trace!(item_id = item.id, delay = &*item.delay, "unparseable update interval");
            return false;
        }
    };

    strpool.replace_opt(&mut item.scheduling_error, None);
    let seed = nextcheck::scheduling_seed(item, interface);
    item.queue_next_check = nextcheck::spread_nextcheck(seed, delay, now);
    true
}

/// Push `item.queue_next_check` onto the unreachable ladder. High-priority
/// entries bypass the throttle and stay due immediately.
pub fn item_unreachable_nextcheck(
    item: &mut Item,
    fail_count: u32,
    disabled_until: i64,
    now: i64,
    delay: i64,
    period: i64,
) {
    if item.queue_priority == QueuePriority::High {
        item.queue_next_check = now;
        return;
    }
    item.queue_next_check =
        nextcheck::unreachable_nextcheck(fail_count, disabled_until, now, delay, period);
}

/// All scheduler queues of the cache: one indexed heap per poller class
/// plus the proxy, trigger-timer, discovery-rule and web-test heaps.
///
/// The queues store ids and keys only; entity state (location, nextcheck)
/// lives in the cache tables, and both are mutated together under the
/// cache write lock.
#[derive(Debug)]
pub struct SchedulerQueues {
    pollers: [IndexedHeap<PollerKey>; PollerClass::COUNT],
    pub proxies: IndexedHeap<i64>,
    // keyed (eval time, trigger id) so ties pop in id order
    pub trigger_timers: IndexedHeap<(i64, Id)>,
    pub drules: IndexedHeap<i64>,
    pub web_tests: IndexedHeap<i64>,
}

impl Default for SchedulerQueues {
    fn default() -> Self {
        Self {
            pollers: std::array::from_fn(|_| IndexedHeap::new()),
            proxies: IndexedHeap::new(),
            trigger_timers: IndexedHeap::new(),
            drules: IndexedHeap::new(),
            web_tests: IndexedHeap::new(),
        }
    }
}

impl SchedulerQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poller(&self, class: PollerClass) -> &IndexedHeap<PollerKey> {
        &self.pollers[class.index()]
    }

    pub fn poller_mut(&mut self, class: PollerClass) -> &mut IndexedHeap<PollerKey> {
        &mut self.pollers[class.index()]
    }

    /// Queue (or re-key) an item in its class heap.
    pub fn enqueue_item(&mut self, class: PollerClass, item_id: Id, key: PollerKey) {
        self.pollers[class.index()].push(item_id, key);
    }

    /// Remove an item from whichever class heap holds it.
    pub fn drop_item(&mut self, item_id: Id) {
        for heap in &mut self.pollers {
            if heap.remove(item_id).is_some() {
                return;
            }
        }
    }

    pub fn queued_items(&self, class: PollerClass) -> usize {
        self.pollers[class.index()].len()
    }
}

/// Hand-out counters per poller class, kept behind their own lock because
/// pollers update them on every batch while the cache lock may be held for
/// a full sync.
#[derive(Debug, Default)]
pub struct PollerStats {
    handed_out: [u64; PollerClass::COUNT],
    in_flight: [usize; PollerClass::COUNT],
}

impl PollerStats {
    pub fn note_dispatched(&mut self, class: PollerClass, count: usize) {
        self.handed_out[class.index()] += count as u64;
        self.in_flight[class.index()] += count;
    }

    pub fn note_returned(&mut self, class: PollerClass, count: usize) {
        let slot = &mut self.in_flight[class.index()];
        *slot = slot.saturating_sub(count);
    }

    pub fn handed_out(&self, class: PollerClass) -> u64 {
        self.handed_out[class.index()]
    }

    pub fn in_flight(&self, class: PollerClass) -> usize {
        self.in_flight[class.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MonitoredStatus, QueueLocation, SnmpOidKind, ValueKind};
    use pretty_assertions::assert_eq;

    fn item(id: Id, kind: ItemKind, key: &str, delay: &str) -> Item {
        let mut pool = StrPool::new();
        Item {
            id,
            host_id: 1,
            kind,
            key: pool.intern(key),
            value_kind: ValueKind::Unsigned,
            delay: pool.intern(delay),
            interface_id: 100,
            status: MonitoredStatus::Active,
            poller: None,
            queue_next_check: 0,
            queue_priority: QueuePriority::Normal,
            location: QueueLocation::Nowhere,
            revision: 0,
            update_triggers: false,
            data_expected_from: 0,
            snmp_oid: None,
            snmp_oid_kind: SnmpOidKind::Normal,
            discovery_rule: false,
            master_id: 0,
            dependents: Vec::new(),
            triggers: Vec::new(),
            scheduling_error: None,
        }
    }

    #[test]
    fn class_assignment() {
        assert_eq!(poller_class(ItemKind::Agent, "agent.ping", false), Some(PollerClass::Normal));
        assert_eq!(
            poller_class(ItemKind::Simple, "icmpping[,4]", false),
            Some(PollerClass::Pinger)
        );
        assert_eq!(
            poller_class(ItemKind::Simple, "net.tcp.service[ssh]", false),
            Some(PollerClass::Normal)
        );
        assert_eq!(poller_class(ItemKind::SnmpAgent, "ifInOctets", false), Some(PollerClass::Snmp));
        assert_eq!(poller_class(ItemKind::Jmx, "jmx[a,b]", false), Some(PollerClass::Java));
        assert_eq!(poller_class(ItemKind::Trapper, "trap", false), None);
        assert_eq!(poller_class(ItemKind::Dependent, "dep", false), None);
        // anything behind a proxy is the proxy's business
        assert_eq!(poller_class(ItemKind::Agent, "agent.ping", true), None);
    }

    #[test]
    fn poller_key_orders_time_then_priority_then_tiebreak() {
        let due_high = PollerKey::new(100, QueuePriority::High, (5, 0, 0));
        let due_normal = PollerKey::new(100, QueuePriority::Normal, (1, 0, 0));
        let later = PollerKey::new(99, QueuePriority::Low, (9, 9, 9));
        assert!(later < due_high);
        assert!(due_high < due_normal);

        let a = PollerKey::new(100, QueuePriority::Normal, (7, 0, 1));
        let b = PollerKey::new(100, QueuePriority::Normal, (7, 0, 2));
        assert!(a < b);
    }

    #[test]
    fn broken_interval_parks_on_sentinel() {
        let mut pool = StrPool::new();
        let mut it = item(10, ItemKind::Agent, "vfs.fs.size[/]", "soon");
        assert!(!item_nextcheck_update(&mut it, None, ItemFlags::NEW, 1000, &mut pool));
        assert_eq!(it.queue_next_check, NEVER);
        assert!(it.scheduling_error.is_some());
    }

    #[test]
    fn reschedule_clears_stale_error() {
        let mut pool = StrPool::new();
        let mut it = item(10, ItemKind::Agent, "vfs.fs.size[/]", "30s");
        it.scheduling_error = Some(pool.intern("old failure"));
        assert!(item_nextcheck_update(&mut it, None, ItemFlags::DELAY_CHANGED, 1000, &mut pool));
        assert!(it.scheduling_error.is_none());
        assert!(it.queue_next_check > 1000);
        assert!(it.queue_next_check <= 1030);
    }

    #[test]
    fn untouched_item_keeps_its_slot() {
        let mut pool = StrPool::new();
        let mut it = item(10, ItemKind::Agent, "key", "1m");
        it.queue_next_check = 5000;
        assert!(item_nextcheck_update(&mut it, None, ItemFlags::empty(), 1000, &mut pool));
        assert_eq!(it.queue_next_check, 5000);
    }

    #[test]
    fn high_priority_skips_the_ladder() {
        let mut it = item(10, ItemKind::Agent, "key", "1m");
        it.queue_priority = QueuePriority::High;
        item_unreachable_nextcheck(&mut it, 3, 2000, 1000, 15, 45);
        assert_eq!(it.queue_next_check, 1000);

        it.queue_priority = QueuePriority::Normal;
        item_unreachable_nextcheck(&mut it, 3, 0, 1000, 15, 45);
        assert_eq!(it.queue_next_check, 1045);
    }

    #[test]
    fn drop_item_searches_every_class() {
        let mut queues = SchedulerQueues::new();
        queues.enqueue_item(
            PollerClass::Snmp,
            7,
            PollerKey::new(100, QueuePriority::Normal, (1, 0, 0)),
        );
        assert_eq!(queues.queued_items(PollerClass::Snmp), 1);
        queues.drop_item(7);
        assert_eq!(queues.queued_items(PollerClass::Snmp), 0);
    }
}
