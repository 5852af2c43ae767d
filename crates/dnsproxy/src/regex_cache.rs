//! Process-wide store of compiled DNS patterns.

use crate::error::{DnsProxyError, Result};
use policy_common::RefCountedMap;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiled patterns keyed by their source text.
///
/// Every lookup takes a reference and every [`RegexCache::release`] drops
/// one; a pattern is evicted when its last reference goes away. Two
/// selectors whose rules generate the same text share one compiled regex.
#[derive(Debug, Default)]
pub struct RegexCache {
    entries: RefCountedMap<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of distinct cached patterns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns how many scopes currently reference `pattern`.
    pub fn ref_count(&self, pattern: &str) -> Option<u32> {
        self.entries.ref_count(pattern)
    }

    /// Takes a reference to the compiled form of `pattern`, compiling it
    /// on first use.
    pub fn lookup_or_compile(&mut self, pattern: &str) -> Result<Arc<Regex>> {
        let regex = self
            .entries
            .try_acquire_or_insert_with(pattern.to_string(), || -> Result<Arc<Regex>> {
                let regex = Regex::new(pattern).map_err(|source| DnsProxyError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
                debug!(pattern, "Compiled DNS pattern");
                Ok(Arc::new(regex))
            })?;
        Ok(Arc::clone(regex))
    }

    /// Takes a reference to an already compiled regex, sharing the cached
    /// copy when one with the same source text exists.
    pub fn lookup_or_insert(&mut self, regex: &Regex) -> Arc<Regex> {
        let cached = self
            .entries
            .acquire_or_insert_with(regex.as_str().to_string(), || Arc::new(regex.clone()));
        Arc::clone(cached)
    }

    /// Drops one reference to `pattern`.
    pub fn release(&mut self, pattern: &str) {
        match self.entries.release(pattern) {
            Ok(Some(_)) => debug!(pattern, "Evicted DNS pattern"),
            Ok(None) => {}
            Err(e) => warn!(pattern, error = %e, "Releasing unknown DNS pattern"),
        }
    }
}
