//! Buffer of pending insert/delete operations with per-key deduplication.

use std::collections::BTreeMap;

/// A pending operation on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp<V> {
    /// Insert or overwrite the key with a value.
    Insert(V),
    /// Delete the key.
    Delete,
}

/// Pending changes for one consumer, deduplicated by key.
///
/// Operations on the same key collapse to the most recent one:
/// - INSERT then DELETE leaves a DELETE
/// - DELETE then INSERT leaves the INSERT
/// - INSERT then INSERT keeps the newer value
///
/// This is sound as long as applying an operation is idempotent, which is
/// the case for set-membership style updates.
///
/// A buffer can also be marked as a *reset*: the consumer must discard
/// everything previously derived from this buffer's scope before applying
/// the buffered operations.
#[derive(Debug, Clone)]
pub struct ChangeBuffer<K, V> {
    reset: bool,
    ops: BTreeMap<K, ChangeOp<V>>,
}

impl<K: Ord, V> ChangeBuffer<K, V> {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            reset: false,
            ops: BTreeMap::new(),
        }
    }

    /// Returns true if there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        !self.reset && self.ops.is_empty()
    }

    /// Returns the number of buffered operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the buffer replaces the previous state of its scope.
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Buffers an insert, replacing any pending operation for the key.
    pub fn push_insert(&mut self, key: K, value: V) {
        self.ops.insert(key, ChangeOp::Insert(value));
    }

    /// Buffers a delete, replacing any pending operation for the key.
    pub fn push_delete(&mut self, key: K) {
        self.ops.insert(key, ChangeOp::Delete);
    }

    /// Marks the buffer as a reset and drops every pending operation.
    pub fn mark_reset(&mut self) {
        self.reset = true;
        self.ops.clear();
    }

    /// Returns the buffered operations in key order.
    pub fn ops(&self) -> &BTreeMap<K, ChangeOp<V>> {
        &self.ops
    }

    /// Takes the buffered state, leaving an empty buffer behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Appends a newer buffer on top of this one.
    ///
    /// A reset in `newer` discards everything buffered here.
    pub fn merge(&mut self, newer: ChangeBuffer<K, V>) {
        if newer.reset {
            self.mark_reset();
        }
        self.ops.extend(newer.ops);
    }

    /// Consumes the buffer into its reset flag and operations.
    pub fn into_parts(self) -> (bool, BTreeMap<K, ChangeOp<V>>) {
        (self.reset, self.ops)
    }
}

impl<K: Ord, V> Default for ChangeBuffer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
