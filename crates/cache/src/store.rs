#![forbid(unsafe_code)]

use std::collections::HashMap;

/// Generic id-keyed entity table.
///
/// Every cache table (hosts, items, interfaces, ...) is an `ElementStore`;
/// per-kind construction runs in the `ctor` closure passed to
/// [`ElementStore::find_or_create`], and per-kind teardown happens on the
/// value moved out of [`ElementStore::remove`] (releasing pooled strings,
/// unlinking dependents) before it is dropped.
///
/// Returned references are only valid until the next mutating call on the
/// same table; they must never be held across a lock release.
#[derive(Debug)]
pub struct ElementStore<T> {
    elems: HashMap<u64, T>,
}

impl<T> Default for ElementStore<T> {
    fn default() -> Self {
        Self {
            elems: HashMap::new(),
        }
    }
}

impl<T> ElementStore<T> {
    /// Look up `id`, creating the element with `ctor` on a miss.
    ///
    /// Returns the element and whether it already existed; an existing
    /// element is returned unchanged.
    pub fn find_or_create(&mut self, id: u64, ctor: impl FnOnce(u64) -> T) -> (&mut T, bool) {
        let mut found = true;
        let elem = self.elems.entry(id).or_insert_with(|| {
            found = false;
            ctor(id)
        });
        (elem, found)
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.elems.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        self.elems.get_mut(&id)
    }

    /// Get two distinct elements mutably, e.g. an item and its master.
    pub fn get_pair_mut(&mut self, a: u64, b: u64) -> Option<(&mut T, &mut T)> {
        if a == b {
            return None;
        }
        let [first, second] = self.elems.get_disjoint_mut([&a, &b]);
        Some((first?, second?))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.elems.contains_key(&id)
    }

    /// Remove `id`, handing the element back so the caller can tear it
    /// down (release pooled strings, unlink from indexes).
    pub fn remove(&mut self, id: u64) -> Option<T> {
        self.elems.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.elems.iter().map(|(id, elem)| (*id, elem))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut T)> {
        self.elems.iter_mut().map(|(id, elem)| (*id, elem))
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.elems.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq)]
    struct Rec {
        id: u64,
        hits: u32,
    }

    #[test]
    fn find_or_create_runs_ctor_once() {
        let mut store = ElementStore::default();
        let (rec, found) = store.find_or_create(7, |id| Rec { id, hits: 0 });
        assert!(!found);
        rec.hits += 1;

        let (rec, found) = store.find_or_create(7, |_| unreachable!("ctor on hit"));
        assert!(found);
        assert_eq!(rec.hits, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_hands_back_the_element() {
        let mut store = ElementStore::default();
        store.find_or_create(3, |id| Rec { id, hits: 9 });
        let rec = store.remove(3).unwrap();
        assert_eq!(rec, Rec { id: 3, hits: 9 });
        assert!(store.remove(3).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn get_pair_mut_rejects_same_id() {
        let mut store = ElementStore::default();
        store.find_or_create(1, |id| Rec { id, hits: 0 });
        store.find_or_create(2, |id| Rec { id, hits: 0 });
        assert!(store.get_pair_mut(1, 1).is_none());
        let (a, b) = store.get_pair_mut(1, 2).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
    }
}
