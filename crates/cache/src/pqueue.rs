#![forbid(unsafe_code)]

use std::collections::HashMap;

/// Indexed binary min-heap: a heap of `(key, id)` pairs plus an id-to-slot
/// map, giving O(log n) keyed update and removal on top of the usual
/// push/pop. Every scheduler queue in the cache is an instance of this
/// type; only the key type differs.
#[derive(Debug)]
pub struct IndexedHeap<K> {
    heap: Vec<(K, u64)>,
    slots: HashMap<u64, usize>,
}

impl<K> Default for IndexedHeap<K> {
    fn default() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K: Ord> IndexedHeap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` with `key`, or change its key if already present.
    pub fn push(&mut self, id: u64, key: K) {
        if let Some(&slot) = self.slots.get(&id) {
            self.heap[slot].0 = key;
            let slot = self.sift_up(slot);
            self.sift_down(slot);
            return;
        }
        self.heap.push((key, id));
        let slot = self.heap.len() - 1;
        self.slots.insert(id, slot);
        self.sift_up(slot);
    }

    /// Remove `id` from any position, returning its key.
    pub fn remove(&mut self, id: u64) -> Option<K> {
        let slot = self.slots.remove(&id)?;
        let last = self.heap.len() - 1;
        if slot != last {
            self.heap.swap(slot, last);
            self.slots.insert(self.heap[slot].1, slot);
        }
        let (key, _) = self.heap.pop()?;
        if slot < self.heap.len() {
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
        Some(key)
    }

    /// Smallest element without removing it.
    pub fn peek(&self) -> Option<(&K, u64)> {
        self.heap.first().map(|(key, id)| (key, *id))
    }

    /// Remove and return the smallest element.
    pub fn pop(&mut self) -> Option<(K, u64)> {
        let id = self.heap.first()?.1;
        let key = self.remove(id)?;
        Some((key, id))
    }

    pub fn key_of(&self, id: u64) -> Option<&K> {
        self.slots.get(&id).map(|&slot| &self.heap[slot].0)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> {
        self.heap.iter().map(|(key, id)| (key, *id))
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.heap[slot].0 >= self.heap[parent].0 {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < self.heap.len() && self.heap[left].0 < self.heap[smallest].0 {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].0 < self.heap[smallest].0 {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slots.insert(self.heap[a].1, a);
        self.slots.insert(self.heap[b].1, b);
    }
}
