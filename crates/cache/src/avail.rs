#![forbid(unsafe_code)]

use crate::error::Error;
use crate::model::Id;
use crate::store::ElementStore;
use crate::strpool::{StrPool, StrRef};
use parking_lot::RwLock;
use tracing::debug;

/// Consecutive failed probes before an interface is shown as Down. The
/// hysteresis absorbs single transient failures, notably from relayed
/// probe reports.
pub const MAX_INTERFACE_FAILURES: u8 = 3;

const RESET_ERROR: &str = "interface availability was reset after host update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostAlive {
    #[default]
    Unknown,
    Alive,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceState {
    #[default]
    Unknown,
    Up,
    Down,
}

/// Interfaces are identified either by their configured id or, for
/// agent-style checks without one, by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterfaceIdent {
    Id(Id),
    Name(String),
}

/// Verdict for "may this interface be probed right now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pollability {
    Pollable,
    Blocked { disabled_until: i64 },
}

#[derive(Debug)]
struct InterfaceAvail {
    ident: InterfaceIdent,
    state: InterfaceState,
    fail_count: u8,
    disabled_until: i64,
    last_change: i64,
    last_update: i64,
    error: Option<StrRef>,
}

#[derive(Debug, Default)]
struct HostAvail {
    last_heartbeat: i64,
    heartbeat_frequency: i64,
    state: HostAlive,
    last_state_change: i64,
    interfaces: Vec<InterfaceAvail>,
}

#[derive(Debug, Default)]
struct AvailInner {
    hosts: ElementStore<HostAvail>,
    strpool: StrPool,
}

/// Change-feed record: one entry per host whose own state or whose
/// interfaces changed since the requested timestamp.
#[derive(Debug, Clone)]
pub struct AvailRecord {
    pub host_id: Id,
    pub host_state: HostAlive,
    pub last_state_change: i64,
    pub interfaces: Vec<InterfaceRecord>,
}

#[derive(Debug, Clone)]
pub struct InterfaceRecord {
    pub ident: InterfaceIdent,
    pub state: InterfaceState,
    pub last_change: i64,
    pub last_update: i64,
    pub error: Option<String>,
}

/// Per-host heartbeat state and per-interface failure/backoff state.
///
/// Consulted on every poll dispatch, so it carries its own lock instead of
/// sharing the cache-wide one; a multi-second configuration resync never
/// blocks a pollability verdict.
#[derive(Debug)]
pub struct AvailabilityTracker {
    inner: RwLock<AvailInner>,
    unreachable_delay: i64,
}

impl AvailabilityTracker {
    pub fn new(unreachable_delay: i64) -> Self {
        Self {
            inner: RwLock::new(AvailInner::default()),
            unreachable_delay,
        }
    }

    /// Record a heartbeat. Creates the record lazily; frequency 0 turns the
    /// host state Unknown.
    pub fn heartbeat(&self, host_id: Id, frequency: i64, now: i64) {
        let mut inner = self.inner.write();
        let (host, _) = inner.hosts.find_or_create(host_id, |_| HostAvail::default());
        host.last_heartbeat = now;
        host.heartbeat_frequency = frequency;
    }

    /// Forget the heartbeat expectation without touching interfaces.
    pub fn reset_heartbeat(&self, host_id: Id, now: i64) {
        self.heartbeat(host_id, 0, now);
    }

    /// Recompute and return the host's overall state. Absent records fail
    /// distinctly from records in the Unknown state.
    pub fn alive_status(&self, host_id: Id, now: i64) -> Result<HostAlive, Error> {
        let mut inner = self.inner.write();
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or(Error::NoAvailabilityRecord(host_id))?;

        let old_state = host.state;
        host.state = if host.heartbeat_frequency == 0 {
            HostAlive::Unknown
        } else if host.last_heartbeat + host.heartbeat_frequency < now {
            HostAlive::Down
        } else {
            HostAlive::Alive
        };
        if old_state != host.state || host.last_state_change == 0 {
            host.last_state_change = now;
        }
        Ok(host.state)
    }

    /// Report a probe outcome for one interface.
    ///
    /// Transitions to Down pass through the fail-count hysteresis: the
    /// visible state only flips once [`MAX_INTERFACE_FAILURES`] consecutive
    /// failures accumulate. Transitions to Up or Unknown flip immediately.
    pub fn set_interface(
        &self,
        host_id: Id,
        ident: InterfaceIdent,
        state: InterfaceState,
        error: &str,
        now: i64,
    ) {
        self.apply_interface(host_id, ident, state, error, 0, now);
    }

    /// Ingest a relayed availability report (e.g. from a proxy). The
    /// reporter already applied its own hysteresis, so the state flips
    /// immediately.
    pub fn ingest_report(
        &self,
        host_id: Id,
        ident: InterfaceIdent,
        state: InterfaceState,
        error: &str,
        now: i64,
    ) {
        self.apply_interface(host_id, ident, state, error, MAX_INTERFACE_FAILURES + 1, now);
    }

    fn apply_interface(
        &self,
        host_id: Id,
        ident: InterfaceIdent,
        state: InterfaceState,
        error: &str,
        reported_fails: u8,
        now: i64,
    ) {
        let mut inner = self.inner.write();
        let AvailInner { hosts, strpool } = &mut *inner;
        let (host, _) = hosts.find_or_create(host_id, |_| HostAvail::default());

        let Some(iface) = host.interfaces.iter_mut().find(|iface| iface.ident == ident) else {
            // first report for this interface: stored as-is, no hysteresis
            host.interfaces.push(InterfaceAvail {
                ident,
                state,
                fail_count: 0,
                disabled_until: 0,
                last_change: now,
                last_update: now,
                error: Some(strpool.intern(error)),
            });
            return;
        };

        strpool.replace_opt(&mut iface.error, Some(error));
        iface.last_update = now;

        if state == iface.state {
            // a confirming non-failure report clears any pending fail run
            if state != InterfaceState::Down {
                iface.fail_count = 0;
            }
            return;
        }

        if state == InterfaceState::Down
            && iface.fail_count < MAX_INTERFACE_FAILURES - 1
            && reported_fails < MAX_INTERFACE_FAILURES
        {
            iface.fail_count += 1;
            return;
        }

        debug!(host_id, ?iface.ident, from = ?iface.state, to = ?state, "interface state change");
        iface.fail_count = 0;
        iface.disabled_until = 0;
        iface.state = state;
        iface.last_change = now;
    }

    /// Current visible state; absent hosts fail, absent interfaces on a
    /// known host read as Unknown.
    pub fn interface_state(
        &self,
        host_id: Id,
        ident: &InterfaceIdent,
    ) -> Result<InterfaceState, Error> {
        let inner = self.inner.read();
        let host = inner
            .hosts
            .get(host_id)
            .ok_or(Error::NoAvailabilityRecord(host_id))?;
        Ok(host
            .interfaces
            .iter()
            .find(|iface| iface.ident == *ident)
            .map(|iface| iface.state)
            .unwrap_or_default())
    }

    /// Failure count and armed backoff for the scheduler's unreachable
    /// ladder; `None` when the interface is not tracked.
    pub fn interface_backoff(&self, host_id: Id, ident: &InterfaceIdent) -> Option<(u32, i64)> {
        let inner = self.inner.read();
        let host = inner.hosts.get(host_id)?;
        host.interfaces
            .iter()
            .find(|iface| iface.ident == *ident)
            .map(|iface| (u32::from(iface.fail_count.max(1)), iface.disabled_until))
    }

    /// Answer "may this interface be probed now".
    ///
    /// Interfaces not known to be Down are always pollable. A Down
    /// interface is blocked until its backoff expires; then exactly one
    /// probe is granted and the backoff is immediately re-armed, so a still
    /// dead interface costs one probe per window.
    pub fn is_pollable(&self, host_id: Id, ident: &InterfaceIdent, now: i64) -> Pollability {
        let mut inner = self.inner.write();
        let Some(host) = inner.hosts.get_mut(host_id) else {
            return Pollability::Pollable;
        };
        let Some(iface) = host.interfaces.iter_mut().find(|iface| iface.ident == *ident) else {
            return Pollability::Pollable;
        };

        if iface.state != InterfaceState::Down {
            return Pollability::Pollable;
        }
        if iface.disabled_until > now {
            return Pollability::Blocked {
                disabled_until: iface.disabled_until,
            };
        }
        iface.disabled_until = now + self.unreachable_delay;
        Pollability::Pollable
    }

    /// Forget everything learned about a host's availability; used when its
    /// monitoring status or proxy assignment changes.
    pub fn reset(&self, host_id: Id, now: i64) {
        let mut inner = self.inner.write();
        let AvailInner { hosts, strpool } = &mut *inner;
        let Some(host) = hosts.get_mut(host_id) else {
            return;
        };
        host.last_heartbeat = 0;
        host.heartbeat_frequency = 0;
        host.state = HostAlive::Unknown;
        host.last_state_change = now;
        for iface in &mut host.interfaces {
            iface.state = InterfaceState::Unknown;
            iface.fail_count = 0;
            iface.disabled_until = 0;
            strpool.replace_opt(&mut iface.error, Some(RESET_ERROR));
            iface.last_change = now;
            iface.last_update = now;
        }
    }

    /// Drop the record entirely; called when the host leaves the cache.
    pub fn remove(&self, host_id: Id) {
        let mut inner = self.inner.write();
        let AvailInner { hosts, strpool } = &mut *inner;
        if let Some(host) = hosts.remove(host_id) {
            for iface in host.interfaces {
                strpool.release_opt(iface.error.as_ref());
            }
        }
    }

    pub fn contains(&self, host_id: Id) -> bool {
        self.inner.read().hosts.contains(host_id)
    }

    /// One record per host whose own state or any interface changed at or
    /// after `since`. Serialization is the caller's concern.
    pub fn changed_since(&self, since: i64) -> Vec<AvailRecord> {
        let inner = self.inner.read();
        let mut records = Vec::new();
        for (host_id, host) in inner.hosts.iter() {
            let interfaces: Vec<_> = host
                .interfaces
                .iter()
                .filter(|iface| iface.last_change >= since)
                .map(|iface| InterfaceRecord {
                    ident: iface.ident.clone(),
                    state: iface.state,
                    last_change: iface.last_change,
                    last_update: iface.last_update,
                    error: iface.error.as_deref().map(str::to_string),
                })
                .collect();
            if interfaces.is_empty() && host.last_state_change < since {
                continue;
            }
            records.push(AvailRecord {
                host_id,
                host_state: host.state,
                last_state_change: host.last_state_change,
                interfaces,
            });
        }
        records.sort_by_key(|record| record.host_id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DELAY: i64 = 15;

    fn tracker() -> AvailabilityTracker {
        AvailabilityTracker::new(DELAY)
    }

    #[test]
    fn heartbeat_alive_then_down() {
        let avail = tracker();
        let now = 1000;
        avail.heartbeat(1245, 5, now);
        assert_eq!(avail.alive_status(1245, now + 1).unwrap(), HostAlive::Alive);
        // past the frequency window
        assert_eq!(avail.alive_status(1245, now + 6).unwrap(), HostAlive::Down);
    }

    #[test]
    fn reset_heartbeat_yields_unknown_even_for_new_hosts() {
        let avail = tracker();
        avail.reset_heartbeat(384, 1000);
        assert_eq!(avail.alive_status(384, 1001).unwrap(), HostAlive::Unknown);

        avail.heartbeat(1245, 5, 1000);
        avail.reset_heartbeat(1245, 1002);
        assert_eq!(avail.alive_status(1245, 1003).unwrap(), HostAlive::Unknown);
    }

    #[test]
    fn deleted_host_fails_distinctly_from_unknown() {
        let avail = tracker();
        avail.heartbeat(1245, 5, 1000);
        avail.remove(1245);
        assert!(matches!(
            avail.alive_status(1245, 1001),
            Err(Error::NoAvailabilityRecord(1245))
        ));
        assert!(matches!(
            avail.alive_status(9999, 1001),
            Err(Error::NoAvailabilityRecord(9999))
        ));
    }

    #[test]
    fn down_needs_three_consecutive_failures() {
        let avail = tracker();
        let ident = InterfaceIdent::Id(1245);
        let now = 5000;

        avail.set_interface(1234, ident.clone(), InterfaceState::Up, "", now);
        for attempt in 1..=2 {
            avail.set_interface(1234, ident.clone(), InterfaceState::Down, "timeout", now + attempt);
            assert_eq!(
                avail.interface_state(1234, &ident).unwrap(),
                InterfaceState::Up,
                "flipped after {attempt} failures"
            );
        }
        avail.set_interface(1234, ident.clone(), InterfaceState::Down, "timeout", now + 3);
        assert_eq!(avail.interface_state(1234, &ident).unwrap(), InterfaceState::Down);
    }

    #[test]
    fn recovery_flips_immediately() {
        let avail = tracker();
        let ident = InterfaceIdent::Id(7);
        for t in 0..3 {
            avail.set_interface(1, ident.clone(), InterfaceState::Down, "x", 100 + t);
        }
        assert_eq!(avail.interface_state(1, &ident).unwrap(), InterfaceState::Down);
        avail.set_interface(1, ident.clone(), InterfaceState::Up, "", 200);
        assert_eq!(avail.interface_state(1, &ident).unwrap(), InterfaceState::Up);
        // fail counter restarted from zero
        avail.set_interface(1, ident.clone(), InterfaceState::Down, "x", 201);
        assert_eq!(avail.interface_state(1, &ident).unwrap(), InterfaceState::Up);
    }

    #[test]
    fn one_shot_retry_after_backoff() {
        let avail = tracker();
        let ident = InterfaceIdent::Id(1245);
        let now = 9000;

        avail.set_interface(1234, ident.clone(), InterfaceState::Up, "", now);
        for t in 1..=3 {
            avail.set_interface(1234, ident.clone(), InterfaceState::Down, "timeout", now + t);
        }
        // first pollability check arms the backoff window
        assert_eq!(avail.is_pollable(1234, &ident, now + 4), Pollability::Pollable);
        match avail.is_pollable(1234, &ident, now + 5) {
            Pollability::Blocked { disabled_until } => assert!(disabled_until > now + 5),
            verdict => panic!("expected Blocked, got {verdict:?}"),
        }
        // window elapsed: exactly one probe, then re-armed
        let later = now + 4 + DELAY + 1;
        assert_eq!(avail.is_pollable(1234, &ident, later), Pollability::Pollable);
        assert!(matches!(
            avail.is_pollable(1234, &ident, later + 1),
            Pollability::Blocked { .. }
        ));
    }

    #[test]
    fn ingest_report_skips_hysteresis() {
        let avail = tracker();
        let ident = InterfaceIdent::Name("snmp-mgmt".to_string());
        avail.set_interface(55, ident.clone(), InterfaceState::Up, "", 100);
        avail.ingest_report(55, ident.clone(), InterfaceState::Down, "relayed", 101);
        assert_eq!(avail.interface_state(55, &ident).unwrap(), InterfaceState::Down);
    }

    #[test]
    fn reset_returns_interfaces_to_unknown() {
        let avail = tracker();
        let a = InterfaceIdent::Id(2);
        let b = InterfaceIdent::Name("BAH".to_string());
        avail.set_interface(10000, a.clone(), InterfaceState::Up, "", 100);
        avail.set_interface(10000, b.clone(), InterfaceState::Up, "wcewe", 100);
        avail.heartbeat(10000, 30, 100);

        avail.reset(10000, 200);
        assert_eq!(avail.interface_state(10000, &a).unwrap(), InterfaceState::Unknown);
        assert_eq!(avail.interface_state(10000, &b).unwrap(), InterfaceState::Unknown);
        assert_eq!(avail.alive_status(10000, 201).unwrap(), HostAlive::Unknown);
    }

    #[test]
    fn change_feed_filters_by_timestamp() {
        let avail = tracker();
        avail.set_interface(1, InterfaceIdent::Id(11), InterfaceState::Up, "", 100);
        avail.set_interface(2, InterfaceIdent::Id(22), InterfaceState::Up, "", 300);

        let records = avail.changed_since(200);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host_id, 2);
        assert_eq!(records[0].interfaces.len(), 1);
        assert_eq!(records[0].interfaces[0].state, InterfaceState::Up);
    }
}
