//! Immutable snapshots tagged with a monotonically increasing version.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Transaction version of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version(u64);

impl Version {
    /// The version of an initial, empty snapshot.
    pub const ZERO: Version = Version(0);

    /// Creates a version from its raw value.
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the following version.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value paired with the version it was published at.
#[derive(Debug)]
pub struct Versioned<T> {
    version: Version,
    value: Arc<T>,
}

impl<T> Versioned<T> {
    /// Returns the snapshot version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the snapshot value.
    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> std::ops::Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Holder of the current snapshot.
///
/// Readers get a cheap clone of the current `Versioned<T>` and never
/// observe a partially applied update. Writers build the next value from
/// the current one under the write lock, so versions are strictly
/// increasing and never reused.
#[derive(Debug)]
pub struct VersionedCell<T> {
    current: RwLock<Versioned<T>>,
}

impl<T> VersionedCell<T> {
    /// Creates a cell holding `value` at [`Version::ZERO`].
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Versioned {
                version: Version::ZERO,
                value: Arc::new(value),
            }),
        }
    }

    /// Returns the current snapshot.
    pub fn load(&self) -> Versioned<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the current version.
    pub fn version(&self) -> Version {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Publishes a new snapshot derived from the current one.
    ///
    /// `f` runs under the write lock and also returns an output for the
    /// caller, which is handed back together with the new snapshot.
    pub fn update<R, F>(&self, f: F) -> (Versioned<T>, R)
    where
        F: FnOnce(&T) -> (T, R),
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let (next, out) = f(&current.value);
        *current = Versioned {
            version: current.version.next(),
            value: Arc::new(next),
        };
        (current.clone(), out)
    }
}

impl<T: Default> Default for VersionedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_version_ordering() {
        assert!(Version::ZERO < Version::ZERO.next());
        assert_eq!(Version::new(3).to_string(), "v3");
    }

    #[test]
    fn test_update_bumps_version() {
        let cell = VersionedCell::new(vec![1u32]);
        let before = cell.load();

        let (after, len) = cell.update(|v| {
            let mut next = v.clone();
            next.push(2);
            let len = next.len();
            (next, len)
        });

        assert_eq!(len, 2);
        assert_eq!(after.version(), Version::new(1));
        assert_eq!(cell.version(), Version::new(1));
        // Old readers keep their snapshot.
        assert_eq!(before.value(), &vec![1]);
        assert_eq!(after.value(), &vec![1, 2]);
    }
}
