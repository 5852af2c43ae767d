//! Per-endpoint enforcement table.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use policy_common::ChangeOp;
use policy_types::{NumericIdentity, PortRange, Protocol, TrafficDirection};

use crate::l4_filter::FilterKey;
use crate::map_changes::FilterDelta;
use crate::per_selector::AuthType;
use crate::selector::CachedSelector;

/// Key of a map-state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Key {
    pub identity: NumericIdentity,
    pub direction: TrafficDirection,
    pub protocol: Protocol,
    pub ports: PortRange,
}

impl Key {
    pub fn new(identity: NumericIdentity, filter: &FilterKey) -> Self {
        Self {
            identity,
            direction: filter.direction,
            protocol: filter.protocol,
            ports: filter.ports,
        }
    }

    /// Returns the key of the filter this entry derives from.
    pub fn filter_key(&self) -> FilterKey {
        FilterKey {
            direction: self.direction,
            protocol: self.protocol,
            ports: self.ports,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "identity={} {} {}/{}",
            self.identity, self.direction, self.ports, self.protocol
        )
    }
}

/// Enforcement value of a map-state entry.
///
/// Presence of the entry means "allow". A non-zero `proxy_port`
/// redirects matching traffic to a proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct EntryValue {
    pub proxy_port: u16,
    pub auth_type: AuthType,
}

impl EntryValue {
    pub fn is_redirect(&self) -> bool {
        self.proxy_port != 0
    }

    /// Combines the contributions of two selectors to the same key.
    ///
    /// Redirects win over plain allows and the stricter auth type wins.
    fn combine(self, other: EntryValue) -> EntryValue {
        EntryValue {
            proxy_port: self.proxy_port.max(other.proxy_port),
            auth_type: self.auth_type.max(other.auth_type),
        }
    }
}

/// A map-state entry together with the selectors that grant it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapStateEntry {
    owners: BTreeMap<CachedSelector, EntryValue>,
}

impl MapStateEntry {
    /// Returns the effective value across all owners.
    pub fn value(&self) -> EntryValue {
        self.owners
            .values()
            .copied()
            .reduce(EntryValue::combine)
            .unwrap_or_default()
    }

    /// Returns the selectors granting this entry.
    pub fn owners(&self) -> impl Iterator<Item = &CachedSelector> {
        self.owners.keys()
    }
}

/// Keys touched by applying changes to a [`MapState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeState {
    /// Keys that were added or whose value changed.
    pub adds: BTreeSet<Key>,
    /// Keys that were removed.
    pub deletes: BTreeSet<Key>,
}

impl ChangeState {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty()
    }

    fn record_add(&mut self, key: Key) {
        self.deletes.remove(&key);
        self.adds.insert(key);
    }

    fn record_delete(&mut self, key: Key) {
        self.adds.remove(&key);
        self.deletes.insert(key);
    }
}

/// Enforcement table of one endpoint.
///
/// Each entry tracks which selectors of its filter grant it, so removing
/// an identity from one selector keeps the entry while another selector
/// of the same filter still selects it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapState {
    entries: BTreeMap<Key, MapStateEntry>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the effective value for `key`.
    pub fn get(&self, key: &Key) -> Option<EntryValue> {
        self.entries.get(key).map(MapStateEntry::value)
    }

    pub fn entry(&self, key: &Key) -> Option<&MapStateEntry> {
        self.entries.get(key)
    }

    /// Iterates over keys and effective values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, EntryValue)> {
        self.entries.iter().map(|(k, e)| (k, e.value()))
    }

    /// Returns the effective table, as seen by the datapath.
    pub fn to_entries(&self) -> BTreeMap<Key, EntryValue> {
        self.iter().map(|(k, v)| (*k, v)).collect()
    }

    /// Records that `selector` grants `key` with `value`.
    pub fn insert_owner(
        &mut self,
        key: Key,
        selector: CachedSelector,
        value: EntryValue,
        changes: &mut ChangeState,
    ) {
        let entry = self.entries.entry(key).or_default();
        let before = (!entry.owners.is_empty()).then(|| entry.value());
        entry.owners.insert(selector, value);
        if before != Some(entry.value()) {
            changes.record_add(key);
        }
    }

    /// Drops the grant of `selector` on `key`, removing the key once no
    /// selector grants it anymore.
    pub fn remove_owner(&mut self, key: &Key, selector: &CachedSelector, changes: &mut ChangeState) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let before = entry.value();
        if entry.owners.remove(selector).is_none() {
            return;
        }
        if entry.owners.is_empty() {
            self.entries.remove(key);
            changes.record_delete(*key);
        } else if entry.value() != before {
            changes.record_add(*key);
        }
    }

    /// Removes every entry derived from the filter at `filter`.
    pub fn remove_filter(&mut self, filter: &FilterKey, changes: &mut ChangeState) {
        self.entries.retain(|key, _| {
            if key.filter_key() == *filter {
                changes.record_delete(*key);
                false
            } else {
                true
            }
        });
    }

    /// Applies one filter's delta.
    pub fn apply_delta(&mut self, filter: &FilterKey, delta: FilterDelta, changes: &mut ChangeState) {
        let (reset, ops) = delta.into_parts();
        if reset {
            self.remove_filter(filter, changes);
        }
        for ((selector, identity), op) in ops {
            let key = Key::new(identity, filter);
            match op {
                ChangeOp::Insert(value) => self.insert_owner(key, selector, value, changes),
                ChangeOp::Delete => self.remove_owner(&key, &selector, changes),
            }
        }
    }
}
