use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// Insert-only table handing out references that live as long as the table.
///
/// Values are boxed so their address never changes when the map rehashes.
/// Entries are never replaced; the only way to remove one is
/// [`Stash::drain_where`], whose caller vouches that no reference into the
/// table is alive.
pub(crate) struct Stash<K, V> {
    map: Mutex<HashMap<K, Box<V>>>,
}

impl<K: Eq + Hash, V> Default for Stash<K, V> {
    fn default() -> Self {
        Stash { map: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash, V> Stash<K, V> {
    fn extend_lifetime<'a>(&'a self, value: &V) -> &'a V {
        // SAFETY: the box is never dropped or moved while `self` is borrowed.
        unsafe { &*(value as *const V) }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let map = self.map.lock();
        map.get(key).map(|v| self.extend_lifetime(v))
    }

    /// Inserts `value` unless the key is already present, in which case
    /// `value` is dropped and the existing entry is returned.
    pub fn insert(&self, key: K, value: V) -> &V {
        let mut map = self.map.lock();
        let entry = map.entry(key).or_insert_with(|| Box::new(value));
        self.extend_lifetime(entry)
    }

    /// Returns the entry for `key`, computing it outside the lock on a miss.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        make: impl FnOnce() -> Result<V, E>,
    ) -> Result<&V, E> {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let value = make()?;
        Ok(self.insert(key, value))
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn values(&self) -> Vec<&V> {
        let map = self.map.lock();
        map.values().map(|v| self.extend_lifetime(v)).collect()
    }

    /// Removes the entries matching `pred` and hands them back, so the caller
    /// can drop them after releasing its own locks.
    ///
    /// # Safety
    /// No reference previously returned by this stash may be used afterwards
    /// for any of the removed entries.
    pub unsafe fn drain_where(&self, mut pred: impl FnMut(&V) -> bool) -> Vec<Box<V>> {
        let mut map = self.map.lock();
        let mut removed = Vec::new();
        for (key, value) in std::mem::take(&mut *map) {
            if pred(&value) {
                removed.push(value);
            } else {
                map.insert(key, value);
            }
        }
        removed
    }
}
