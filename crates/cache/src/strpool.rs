#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

/// A handle into the string pool. Cheap to clone; comparing two refs from
/// the same pool compares content.
pub type StrRef = Arc<str>;

/// Reference-counted string interning table.
///
/// Every entity field that stores text holds a [`StrRef`] obtained from the
/// pool; equal strings share one slot. The pool keeps its own refcount per
/// slot (the `Arc` count is an implementation detail of the handle) and
/// frees the slot when the last reference is released.
///
/// All operations must run under the cache write lock; the pool has no
/// locking of its own.
#[derive(Debug, Default)]
pub struct StrPool {
    slots: HashMap<Arc<str>, usize>,
}

impl StrPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `value`, returning the shared slot. Refcount starts at 1 for
    /// a new slot and is incremented for an existing one.
    pub fn intern(&mut self, value: &str) -> StrRef {
        if let Some((slot, _)) = self.slots.get_key_value(value) {
            let slot = Arc::clone(slot);
            if let Some(count) = self.slots.get_mut(value) {
                *count += 1;
            }
            return slot;
        }
        let slot: Arc<str> = Arc::from(value);
        self.slots.insert(Arc::clone(&slot), 1);
        slot
    }

    /// Take an additional reference to an already interned slot.
    pub fn acquire(&mut self, slot: &StrRef) -> StrRef {
        if let Some(count) = self.slots.get_mut(&**slot) {
            *count += 1;
        }
        Arc::clone(slot)
    }

    /// Drop one reference; the slot is freed at refcount zero.
    pub fn release(&mut self, slot: &StrRef) {
        if let Some(count) = self.slots.get_mut(&**slot) {
            *count -= 1;
            if *count == 0 {
                self.slots.remove(&**slot);
            }
        }
    }

    pub fn release_opt(&mut self, slot: Option<&StrRef>) {
        if let Some(slot) = slot {
            self.release(slot);
        }
    }

    /// Replace `curr` with an interned copy of `value`.
    ///
    /// Returns whether the stored string actually changed. This return value
    /// drives every dirty-checked revision bump in the sync engine, so it
    /// must be false when the old and new values are equal.
    pub fn replace(&mut self, curr: &mut StrRef, value: &str) -> bool {
        if &**curr == value {
            return false;
        }
        let new = self.intern(value);
        let old = std::mem::replace(curr, new);
        self.release(&old);
        true
    }

    /// [`StrPool::replace`] for optional fields.
    pub fn replace_opt(&mut self, curr: &mut Option<StrRef>, value: Option<&str>) -> bool {
        match (curr.as_ref(), value) {
            (None, None) => false,
            (Some(old), Some(new)) if &**old == new => false,
            _ => {
                if let Some(old) = curr.take() {
                    self.release(&old);
                }
                *curr = value.map(|v| self.intern(v));
                true
            }
        }
    }

    /// Current refcount of `value`, zero when not interned.
    pub fn refs(&self, value: &str) -> usize {
        self.slots.get(value).copied().unwrap_or(0)
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn intern_dedupes_equal_strings() {
        let mut pool = StrPool::new();
        let a = pool.intern("system.cpu.load");
        let b = pool.intern("system.cpu.load");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.refs("system.cpu.load"), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn release_frees_at_zero() {
        let mut pool = StrPool::new();
        let a = pool.intern("10.0.0.1");
        let b = pool.acquire(&a);
        pool.release(&a);
        assert_eq!(pool.refs("10.0.0.1"), 1);
        pool.release(&b);
        assert_eq!(pool.refs("10.0.0.1"), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn replace_is_dirty_only_on_change() {
        let mut pool = StrPool::new();
        let mut slot = pool.intern("1m");
        assert!(!pool.replace(&mut slot, "1m"));
        assert_eq!(pool.refs("1m"), 1);

        assert!(pool.replace(&mut slot, "30s"));
        assert_eq!(&*slot, "30s");
        assert_eq!(pool.refs("1m"), 0);
        assert_eq!(pool.refs("30s"), 1);
    }

    #[test]
    fn replace_opt_covers_presence_changes() {
        let mut pool = StrPool::new();
        let mut slot = None;
        assert!(!pool.replace_opt(&mut slot, None));
        assert!(pool.replace_opt(&mut slot, Some("public")));
        assert!(!pool.replace_opt(&mut slot, Some("public")));
        assert!(pool.replace_opt(&mut slot, None));
        assert!(pool.is_empty());
    }

    #[test]
    fn shared_slot_survives_partial_release() {
        let mut pool = StrPool::new();
        let key_a = pool.intern("net.if.in[eth0]");
        let _key_b = pool.intern("net.if.in[eth0]");
        pool.release(&key_a);
        assert_eq!(pool.refs("net.if.in[eth0]"), 1);
    }

    const WORDS: [&str; 6] = ["a", "b", "system.cpu.load", "1m", "10.0.0.1", ""];

    #[derive(Debug, Clone)]
    enum Op {
        Intern(usize),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..WORDS.len()).prop_map(Op::Intern),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn refcounts_match_a_naive_model(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let mut pool = StrPool::new();
            let mut handles: Vec<StrRef> = Vec::new();
            let mut model: HashMap<&str, usize> = HashMap::new();

            for op in ops {
                match op {
                    Op::Intern(w) => {
                        let word = WORDS[w];
                        handles.push(pool.intern(word));
                        *model.entry(word).or_default() += 1;
                    }
                    Op::Release(raw) => {
                        if handles.is_empty() {
                            continue;
                        }
                        let slot = handles.swap_remove(raw % handles.len());
                        if let Some(count) = model.get_mut(&*slot) {
                            *count -= 1;
                        }
                        pool.release(&slot);
                    }
                }
            }

            for word in WORDS {
                prop_assert_eq!(pool.refs(word), model.get(word).copied().unwrap_or(0));
            }
            prop_assert_eq!(pool.len(), model.values().filter(|&&count| count > 0).count());
        }
    }
}
