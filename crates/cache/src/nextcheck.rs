#![forbid(unsafe_code)]

use crate::error::Error;
use crate::model::{Interface, Item, ItemKind, SnmpOidKind};

/// Parse an update-interval expression into seconds.
///
/// Accepts a plain number of seconds or a number with an `s`/`m`/`h`/`d`
/// suffix. Zero, empty and malformed intervals are errors; the caller parks
/// the item on the far-future sentinel and surfaces the message.
pub fn parse_delay(delay: &str) -> Result<i64, Error> {
    let invalid = |reason: &str| Error::InvalidInterval {
        delay: delay.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = delay.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty interval"));
    }

    let (digits, unit) = match trimmed.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&trimmed[..idx], Some(c)),
        _ => (trimmed, None),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| invalid("not a whole number of time units"))?;

    let seconds = match unit {
        None | Some('s') => Some(value),
        Some('m') => value.checked_mul(60),
        Some('h') => value.checked_mul(3600),
        Some('d') => value.checked_mul(86400),
        Some(_) => return Err(invalid("unknown time unit suffix")),
    };
    let seconds = seconds.ok_or_else(|| invalid("interval out of range"))?;

    if seconds <= 0 {
        return Err(invalid("interval must be positive"));
    }
    Ok(seconds)
}

/// Scheduling seed: items that must stay phase-aligned (sharing a
/// batch-eligible interface) seed from the interface id, everything else
/// from the item id.
pub fn scheduling_seed(item: &Item, interface: Option<&Interface>) -> u64 {
    match item.kind {
        ItemKind::Jmx => item.interface_id,
        ItemKind::SnmpAgent => {
            if item.snmp_oid_kind == SnmpOidKind::Walk {
                item.id
            } else if interface.is_some_and(|iface| !iface.bulk_enabled()) {
                item.id
            } else {
                item.interface_id
            }
        }
        ItemKind::Simple if is_ping_key(&item.key) => item.interface_id,
        _ => item.id,
    }
}

pub fn is_ping_key(key: &str) -> bool {
    key.starts_with("icmpping")
}

/// Spread nextcheck: anchor on the delay grid, offset by `seed mod delay`,
/// then roll forward past `now`. Items with equal delay land evenly across
/// the period while equal seeds stay phase-aligned.
pub fn spread_nextcheck(seed: u64, delay: i64, now: i64) -> i64 {
    let mut nextcheck = delay
        .saturating_mul(now / delay)
        .saturating_add((seed as i64).rem_euclid(delay));
    while nextcheck <= now {
        nextcheck = nextcheck.saturating_add(delay);
    }
    nextcheck
}

/// Backoff ladder for items on an unreachable interface: the retry gap
/// grows with the consecutive-failure count up to `period`, and never
/// extends past an armed `disabled_until`.
pub fn unreachable_nextcheck(
    fail_count: u32,
    disabled_until: i64,
    now: i64,
    delay: i64,
    period: i64,
) -> i64 {
    let step = delay.saturating_mul(i64::from(fail_count.max(1))).min(period);
    let nextcheck = now + step;
    if disabled_until > now {
        nextcheck.min(disabled_until)
    } else {
        nextcheck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn parses_plain_and_suffixed_intervals() {
        assert_eq!(parse_delay("30").unwrap(), 30);
        assert_eq!(parse_delay("45s").unwrap(), 45);
        assert_eq!(parse_delay("5m").unwrap(), 300);
        assert_eq!(parse_delay("2h").unwrap(), 7200);
        assert_eq!(parse_delay("1d").unwrap(), 86400);
    }

    #[test]
    fn rejects_broken_intervals() {
        for bad in ["", "0", "0m", "-5", "5x", "m", "1.5m", "every minute"] {
            assert!(parse_delay(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn huge_intervals_error_instead_of_overflowing() {
        for bad in ["999999999999999d", "9223372036854775807h", "153722867280912931m"] {
            assert!(parse_delay(bad).is_err(), "accepted {bad:?}");
        }
        // the largest representable plain-second interval still parses
        assert_eq!(parse_delay("9223372036854775807").unwrap(), i64::MAX);
    }

    #[test]
    fn spread_is_in_the_future_and_on_phase() {
        let now = 1_700_000_123;
        let nextcheck = spread_nextcheck(42, 60, now);
        assert!(nextcheck > now);
        assert!(nextcheck <= now + 60);
        assert_eq!(nextcheck % 60, 42);
    }

    #[test]
    fn ladder_grows_and_caps() {
        let now = 1000;
        assert_eq!(unreachable_nextcheck(1, 0, now, 15, 45), 1015);
        assert_eq!(unreachable_nextcheck(2, 0, now, 15, 45), 1030);
        assert_eq!(unreachable_nextcheck(3, 0, now, 15, 45), 1045);
        assert_eq!(unreachable_nextcheck(9, 0, now, 15, 45), 1045);
        // an armed disabled_until bounds the retry
        assert_eq!(unreachable_nextcheck(3, 1010, now, 15, 45), 1010);
    }

    proptest! {
        #[test]
        fn spread_phase_equals_seed_phase(
            seed in 0..u64::from(u32::MAX),
            delay in 1..86_400i64,
            now in 0..2_000_000_000i64,
        ) {
            let nextcheck = spread_nextcheck(seed, delay, now);
            prop_assert!(nextcheck > now);
            prop_assert!(nextcheck <= now + delay);
            prop_assert_eq!(nextcheck % delay, (seed as i64) % delay);
        }
    }
}
