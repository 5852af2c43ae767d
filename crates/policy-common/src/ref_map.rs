//! Shared values looked up by key and dropped with their last reference.
//!
//! Entries are only created by the `acquire_or_insert` family of methods
//! and only removed by the release that takes their count to zero, so a
//! lookup can never resurrect or leak an entry.

use std::borrow::Borrow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefMapError {
    #[error("key not found")]
    KeyNotFound,
}

#[derive(Debug, Clone)]
struct Counted<V> {
    value: V,
    refs: u32,
}

/// Map whose entries carry a reference count.
///
/// # Example
///
/// ```
/// use policy_common::RefCountedMap;
///
/// let mut map: RefCountedMap<String, u32> = RefCountedMap::new();
/// map.acquire_or_insert_with("a".to_string(), || 7);
/// map.acquire_or_insert_with("a".to_string(), || 8);
/// assert_eq!(map.get("a"), Some(&7));
/// assert_eq!(map.ref_count("a"), Some(2));
///
/// assert_eq!(map.release("a"), Ok(None));
/// assert_eq!(map.release("a"), Ok(Some(7)));
/// assert!(map.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct RefCountedMap<K, V> {
    entries: HashMap<K, Counted<V>>,
}

impl<K: Eq + Hash, V> RefCountedMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the value without taking a reference.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|c| &c.value)
    }

    pub fn ref_count<Q>(&self, key: &Q) -> Option<u32>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|c| c.refs)
    }

    /// Takes a reference to an existing entry.
    pub fn acquire<Q>(&mut self, key: &Q) -> Result<&V, RefMapError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.get_mut(key).ok_or(RefMapError::KeyNotFound)?;
        entry.refs += 1;
        Ok(&entry.value)
    }

    /// Takes a reference to the entry for `key`, creating it with `make`
    /// if absent.
    pub fn acquire_or_insert_with<F>(&mut self, key: K, make: F) -> &V
    where
        F: FnOnce() -> V,
    {
        match self.try_acquire_or_insert_with(key, || Ok::<V, Infallible>(make())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`RefCountedMap::acquire_or_insert_with`], but `make` may fail,
    /// in which case nothing is inserted.
    pub fn try_acquire_or_insert_with<F, E>(&mut self, key: K, make: F) -> Result<&V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.refs += 1;
                Ok(&entry.value)
            }
            Entry::Vacant(vacant) => {
                let value = make()?;
                Ok(&vacant.insert(Counted { value, refs: 1 }).value)
            }
        }
    }

    /// Drops one reference. Returns the value if it was the last one.
    pub fn release<Q>(&mut self, key: &Q) -> Result<Option<V>, RefMapError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.get_mut(key).ok_or(RefMapError::KeyNotFound)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }
        Ok(self.entries.remove(key).map(|c| c.value))
    }
}

impl<K: Eq + Hash, V> Default for RefCountedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_never_creates() {
        let mut map: RefCountedMap<String, i32> = RefCountedMap::new();

        assert!(map.get("missing").is_none());
        assert_eq!(map.acquire("missing"), Err(RefMapError::KeyNotFound));
        assert!(map.is_empty());
    }

    #[test]
    fn test_failed_insert_leaves_nothing() {
        let mut map: RefCountedMap<&str, i32> = RefCountedMap::new();

        let res = map.try_acquire_or_insert_with("k", || Err("boom"));
        assert_eq!(res, Err("boom"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_existing_entry_is_shared() {
        let mut map: RefCountedMap<&str, i32> = RefCountedMap::new();
        map.acquire_or_insert_with("k", || 1);

        // The factory is not called for an existing key.
        let v = map.try_acquire_or_insert_with("k", || Err(())).unwrap();
        assert_eq!(*v, 1);
        assert_eq!(map.acquire("k"), Ok(&1));
        assert_eq!(map.ref_count("k"), Some(3));
    }

    #[test]
    fn test_release_removes_last() {
        let mut map: RefCountedMap<String, i32> = RefCountedMap::new();
        map.acquire_or_insert_with("key".to_string(), || 42);
        map.acquire("key").unwrap();

        assert_eq!(map.release("key"), Ok(None));
        assert_eq!(map.len(), 1);
        assert_eq!(map.release("key"), Ok(Some(42)));
        assert!(map.is_empty());
        assert_eq!(map.release("key"), Err(RefMapError::KeyNotFound));
    }
}
