//! Per-endpoint buffering of map-state deltas.
//!
//! Producers accumulate deltas per filter and then sync them, which makes
//! them visible to the endpoint's consumer tagged with the selector cache
//! version they were computed against. The consumer takes all visible
//! deltas at once and must release them before producers can publish
//! again.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use policy_common::{ChangeBuffer, Version};
use serde::Serialize;
use policy_types::{EndpointId, NumericIdentity};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::l4_filter::FilterKey;
use crate::map_state::EntryValue;
use crate::selector::CachedSelector;

/// Pending operations for one filter, keyed by (selector, identity).
pub type FilterDelta = ChangeBuffer<(CachedSelector, NumericIdentity), EntryValue>;

/// Result of syncing one filter for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The delta is now visible to the consumer.
    Published,
    /// The delta was stale, or the endpoint is gone.
    Discarded,
    /// Nothing was pending.
    Empty,
}

/// Aggregated outcomes of a sync across endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub published: usize,
    pub discarded: usize,
    pub empty: usize,
}

impl SyncSummary {
    pub(crate) fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Published => self.published += 1,
            SyncOutcome::Discarded => self.discarded += 1,
            SyncOutcome::Empty => self.empty += 1,
        }
    }

    /// Adds the counts of `other`.
    pub fn add(&mut self, other: SyncSummary) {
        self.published += other.published;
        self.discarded += other.discarded;
        self.empty += other.empty;
    }
}

/// A delta made visible to the consumer.
#[derive(Debug)]
pub(crate) struct SyncedDelta {
    pub filter: FilterKey,
    pub version: Version,
    pub delta: FilterDelta,
}

#[derive(Debug, Default)]
struct Inner {
    /// Version of the snapshot the endpoint's map state was built from.
    base_version: Version,
    pending: BTreeMap<FilterKey, FilterDelta>,
    synced: VecDeque<SyncedDelta>,
    last_synced: BTreeMap<FilterKey, Version>,
    in_flight: bool,
    closed: bool,
}

/// Delta buffers of one endpoint.
#[derive(Debug)]
pub struct MapChanges {
    endpoint: EndpointId,
    inner: Mutex<Inner>,
    released: Condvar,
}

impl MapChanges {
    pub(crate) fn new(endpoint: EndpointId, base_version: Version) -> Self {
        Self {
            endpoint,
            inner: Mutex::new(Inner {
                base_version,
                ..Default::default()
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the version of the registration snapshot.
    pub fn base_version(&self) -> Version {
        self.lock().base_version
    }

    /// Returns true if deltas are pending or visible but not consumed.
    pub fn has_changes(&self) -> bool {
        let inner = self.lock();
        !inner.synced.is_empty() || inner.pending.values().any(|d| !d.is_empty())
    }

    /// Buffers `delta` on top of what is pending for `filter`.
    pub(crate) fn accumulate(&self, filter: FilterKey, delta: FilterDelta) {
        if delta.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.pending.entry(filter).or_default().merge(delta);
    }

    /// Makes the pending delta of `filter` visible at `version`.
    ///
    /// Blocks while the consumer holds unreleased changes.
    pub(crate) fn sync(&self, filter: &FilterKey, version: Version) -> SyncOutcome {
        let mut inner = self.lock();
        while inner.in_flight && !inner.closed {
            inner = self
                .released
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.closed {
            return SyncOutcome::Discarded;
        }

        let Some(delta) = inner.pending.remove(filter) else {
            return SyncOutcome::Empty;
        };
        if delta.is_empty() {
            return SyncOutcome::Empty;
        }

        // Reset deltas carry filter changes, which the registration
        // snapshot version does not cover.
        if !delta.is_reset() && version <= inner.base_version {
            warn!(
                endpoint = self.endpoint,
                filter = %filter,
                version = %version,
                base = %inner.base_version,
                "Discarding delta already contained in registration snapshot"
            );
            return SyncOutcome::Discarded;
        }
        if let Some(last) = inner.last_synced.get(filter) {
            if version < *last {
                warn!(
                    endpoint = self.endpoint,
                    filter = %filter,
                    version = %version,
                    last = %last,
                    "Discarding stale delta"
                );
                return SyncOutcome::Discarded;
            }
        }

        debug!(
            endpoint = self.endpoint,
            filter = %filter,
            version = %version,
            ops = delta.len(),
            reset = delta.is_reset(),
            "Published map changes"
        );
        inner.last_synced.insert(*filter, version);
        inner.synced.push_back(SyncedDelta {
            filter: *filter,
            version,
            delta,
        });
        SyncOutcome::Published
    }

    /// Takes every visible delta and marks them as in flight.
    pub(crate) fn acquire(&self) -> Result<Vec<SyncedDelta>, SyncError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SyncError::NotRegistered(self.endpoint));
        }
        if inner.in_flight {
            return Err(SyncError::ConsumptionContention(self.endpoint));
        }
        inner.in_flight = true;
        Ok(inner.synced.drain(..).collect())
    }

    /// Acknowledges the deltas taken by [`MapChanges::acquire`].
    pub(crate) fn release(&self) {
        let mut inner = self.lock();
        inner.in_flight = false;
        drop(inner);
        self.released.notify_all();
    }

    /// Stops delivery and drops everything buffered.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.pending.clear();
        inner.synced.clear();
        drop(inner);
        self.released.notify_all();
    }
}
