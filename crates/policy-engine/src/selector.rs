//! Cached selectors and the versioned selection snapshot.

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use policy_common::{Version, Versioned, VersionedCell};
use policy_types::NumericIdentity;
use tracing::debug;

/// Handle to a peer selector.
///
/// Selectors are compared by their key, so two handles built from the same
/// selector expression refer to the same selections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CachedSelector {
    key: Arc<str>,
    wildcard: bool,
}

impl CachedSelector {
    /// Creates a selector that selects the identities published for it.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self {
            key: Arc::from(key.as_ref()),
            wildcard: false,
        }
    }

    /// Creates a selector that selects every peer.
    pub fn wildcard(key: impl AsRef<str>) -> Self {
        Self {
            key: Arc::from(key.as_ref()),
            wildcard: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true if the selector selects every peer.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

impl fmt::Display for CachedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl Serialize for CachedSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}

/// Identities selected by each selector at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSnapshot {
    selections: BTreeMap<CachedSelector, Arc<BTreeSet<NumericIdentity>>>,
}

impl SelectionSnapshot {
    /// Returns the identities selected by `selector`.
    ///
    /// Wildcard selectors yield only [`NumericIdentity::ANY`].
    pub fn selections(&self, selector: &CachedSelector) -> Vec<NumericIdentity> {
        if selector.is_wildcard() {
            return vec![NumericIdentity::ANY];
        }
        self.selections
            .get(selector)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true if `selector` selects `identity`.
    pub fn selects(&self, selector: &CachedSelector, identity: NumericIdentity) -> bool {
        selector.is_wildcard()
            || self
                .selections
                .get(selector)
                .is_some_and(|ids| ids.contains(&identity))
    }
}

/// Identity changes of one selector, as published at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionUpdate {
    pub selector: CachedSelector,
    pub added: Vec<NumericIdentity>,
    pub deleted: Vec<NumericIdentity>,
    pub version: Version,
}

impl SelectionUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

/// Source of truth for selector selections.
///
/// Every update publishes a new snapshot with the next version. Readers
/// see either the old or the new snapshot, never a mix.
#[derive(Debug, Default)]
pub struct SelectorCache {
    cell: VersionedCell<SelectionSnapshot>,
}

impl SelectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Versioned<SelectionSnapshot> {
        self.cell.load()
    }

    pub fn version(&self) -> Version {
        self.cell.version()
    }

    /// Applies identity changes to `selector` and publishes a new snapshot.
    ///
    /// The returned update only lists effective changes: adding an identity
    /// that is already selected, or deleting one that is not, is dropped.
    pub fn update(
        &self,
        selector: &CachedSelector,
        added: &[NumericIdentity],
        deleted: &[NumericIdentity],
    ) -> SelectionUpdate {
        let (snapshot, (added, deleted)) = self.cell.update(|current| {
            let mut next = current.clone();
            let mut ids = next
                .selections
                .get(selector)
                .map(|ids| (**ids).clone())
                .unwrap_or_default();

            let mut eff_added = Vec::new();
            let mut eff_deleted = Vec::new();
            for id in deleted {
                if ids.remove(id) {
                    eff_deleted.push(*id);
                }
            }
            for id in added {
                if ids.insert(*id) {
                    eff_added.push(*id);
                }
            }

            if ids.is_empty() {
                next.selections.remove(selector);
            } else {
                next.selections.insert(selector.clone(), Arc::new(ids));
            }
            (next, (eff_added, eff_deleted))
        });

        debug!(
            selector = %selector,
            version = %snapshot.version(),
            added = added.len(),
            deleted = deleted.len(),
            "Published selector update"
        );

        SelectionUpdate {
            selector: selector.clone(),
            added,
            deleted,
            version: snapshot.version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(v: &[u32]) -> Vec<NumericIdentity> {
        v.iter().copied().map(NumericIdentity::new).collect()
    }

    #[test]
    fn test_update_reports_effective_changes() {
        let cache = SelectorCache::new();
        let sel = CachedSelector::new("app=web");

        let first = cache.update(&sel, &ids(&[1, 2]), &[]);
        assert_eq!(first.added, ids(&[1, 2]));
        assert_eq!(first.version, Version::new(1));

        let second = cache.update(&sel, &ids(&[2, 3]), &ids(&[1, 9]));
        assert_eq!(second.added, ids(&[3]));
        assert_eq!(second.deleted, ids(&[1]));
        assert_eq!(second.version, Version::new(2));

        assert_eq!(cache.snapshot().selections(&sel), ids(&[2, 3]));
    }

    #[test]
    fn test_wildcard_selects_any() {
        let snapshot = SelectionSnapshot::default();
        let wildcard = CachedSelector::wildcard("all");

        assert_eq!(snapshot.selections(&wildcard), vec![NumericIdentity::ANY]);
        assert!(snapshot.selects(&wildcard, NumericIdentity::new(42)));
        assert!(!snapshot.selects(&CachedSelector::new("x"), NumericIdentity::new(42)));
    }

    #[test]
    fn test_old_snapshot_is_stable() {
        let cache = SelectorCache::new();
        let sel = CachedSelector::new("app=db");
        cache.update(&sel, &ids(&[7]), &[]);

        let before = cache.snapshot();
        cache.update(&sel, &[], &ids(&[7]));

        assert_eq!(before.selections(&sel), ids(&[7]));
        assert!(cache.snapshot().selections(&sel).is_empty());
    }
}
