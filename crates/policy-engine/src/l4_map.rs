//! Port-range filter table.
//!
//! Filters are addressed by their exact (protocol, start, end) key.
//! Overlapping ranges are independent entries: `[1,1023]` and `[1,65534]`
//! on TCP coexist, and removing one leaves the other untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use policy_types::Protocol;

use crate::l4_filter::L4Filter;

/// Exact key of a filter within one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RangeKey {
    protocol: Protocol,
    start: u16,
    end: u16,
}

impl RangeKey {
    fn new(start: u16, end: u16, protocol: Protocol) -> Self {
        // A single port may be given as `end == 0` or `end == start`.
        let end = if end == 0 { start } else { end };
        Self {
            protocol,
            start,
            end,
        }
    }
}

/// Filters of one direction, keyed by exact port range and protocol.
#[derive(Debug, Clone, Default)]
pub struct L4PolicyMap {
    filters: BTreeMap<RangeKey, Arc<L4Filter>>,
}

impl L4PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Inserts or replaces the filter at the exact key.
    ///
    /// Returns the replaced filter.
    pub fn upsert(
        &mut self,
        start: u16,
        end: u16,
        protocol: Protocol,
        filter: Arc<L4Filter>,
    ) -> Option<Arc<L4Filter>> {
        self.filters
            .insert(RangeKey::new(start, end, protocol), filter)
    }

    /// Inserts or replaces `filter` at its own key.
    pub fn upsert_filter(&mut self, filter: Arc<L4Filter>) -> Option<Arc<L4Filter>> {
        let (start, end) = (filter.ports.start(), filter.ports.end());
        self.upsert(start, end, filter.protocol, filter)
    }

    /// Returns the filter stored at exactly this key.
    pub fn exact_lookup(&self, start: u16, end: u16, protocol: Protocol) -> Option<&Arc<L4Filter>> {
        self.filters.get(&RangeKey::new(start, end, protocol))
    }

    /// Removes the filter stored at exactly this key.
    pub fn delete(&mut self, start: u16, end: u16, protocol: Protocol) -> Option<Arc<L4Filter>> {
        self.filters.remove(&RangeKey::new(start, end, protocol))
    }

    /// Iterates over all filters whose range contains `port` on `protocol`.
    ///
    /// Filters for [`Protocol::Any`] match every protocol.
    pub fn matching(&self, port: u16, protocol: Protocol) -> impl Iterator<Item = &Arc<L4Filter>> {
        self.filters.iter().filter_map(move |(key, filter)| {
            let proto_match = key.protocol == protocol || key.protocol == Protocol::Any;
            let port_match = filter.ports.is_wildcard() || filter.ports.contains(port);
            (proto_match && port_match).then_some(filter)
        })
    }

    /// Iterates over all filters in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<L4Filter>> {
        self.filters.values()
    }
}

impl FromIterator<L4Filter> for L4PolicyMap {
    fn from_iter<I: IntoIterator<Item = L4Filter>>(iter: I) -> Self {
        let mut map = L4PolicyMap::new();
        for filter in iter {
            map.upsert_filter(Arc::new(filter));
        }
        map
    }
}
