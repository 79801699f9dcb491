//! Keyed ordered lists with concurrent access.

use dashmap::DashMap;
use std::hash::Hash;

/// A concurrent map from key to an insertion-ordered list of items.
///
/// Readers and writers of the same key are serialized; operations on distinct
/// keys proceed concurrently. Iteration works on a snapshot of the per-key
/// list, so it tolerates concurrent appends: items appended mid-iteration may
/// or may not be observed, but the order of observed items is always the
/// insertion order.
#[derive(Debug, Default)]
pub struct ListMap<K, T>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Vec<T>>,
}

impl<K, T> ListMap<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Append `items` in order to the list for `key`
    pub fn add_item(&self, key: K, items: impl IntoIterator<Item = T>) {
        self.entries.entry(key).or_default().extend(items);
    }

    /// Bounds-checked read of the item at `index` in the list for `key`
    #[must_use]
    pub fn item_at(&self, key: &K, index: usize) -> Option<T> {
        self.entries.get(key).and_then(|list| list.get(index).cloned())
    }

    /// Call `f(index, item)` for each item under `key` in insertion order
    pub fn range(&self, key: &K, mut f: impl FnMut(usize, &T)) {
        let snapshot = match self.entries.get(key) {
            Some(list) => list.clone(),
            None => return,
        };
        for (i, item) in snapshot.iter().enumerate() {
            f(i, item);
        }
    }

    /// Call `f(key, index, item)` for every item under every key
    pub fn range_all(&self, mut f: impl FnMut(&K, usize, &T)) {
        for key in self.keys() {
            let snapshot = match self.entries.get(&key) {
                Some(list) => list.clone(),
                None => continue,
            };
            for (i, item) in snapshot.iter().enumerate() {
                f(&key, i, item);
            }
        }
    }

    /// A snapshot of the list under `key`
    #[must_use]
    pub fn items(&self, key: &K) -> Vec<T> {
        self.entries.get(key).map(|list| list.clone()).unwrap_or_default()
    }

    /// Drop `key` and its whole list
    pub fn remove_key(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Remove the first item under `key` matching `predicate`.
    ///
    /// Returns the removed item. Surviving items keep their relative order.
    pub fn remove_item(&self, key: &K, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut list = self.entries.get_mut(key)?;
        let pos = list.iter().position(|item| predicate(item))?;
        Some(list.remove(pos))
    }

    /// Remove the item at `index` under `key`, if in bounds
    pub fn remove_item_at(&self, key: &K, index: usize) -> Option<T> {
        let mut list = self.entries.get_mut(key)?;
        if index < list.len() {
            Some(list.remove(index))
        } else {
            None
        }
    }

    /// Remove up to `limit` items under `key` matching `predicate`; a limit
    /// of 0 removes every match. Returns the number removed.
    pub fn remove_items(&self, key: &K, predicate: impl Fn(&T) -> bool, limit: usize) -> usize {
        let mut list = match self.entries.get_mut(key) {
            Some(list) => list,
            None => return 0,
        };
        let mut removed = 0;
        let mut i = 0;
        while i < list.len() {
            if predicate(&list[i]) && (limit == 0 || removed < limit) {
                list.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// All keys currently present (including keys with emptied lists)
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of keys with at least one item
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.value().is_empty()).count()
    }

    /// Whether no key holds any item
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items under `key`
    #[must_use]
    pub fn key_len(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, |list| list.len())
    }
}
