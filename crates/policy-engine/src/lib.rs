//! L4/L7 policy compilation and incremental map-state synchronization.
//!
//! This crate turns port rules into per-port filters and keeps the
//! enforcement tables of many endpoints in sync with them:
//!
//! - [`L7ParserType`]: L7 parser tags and their merge lattice
//! - [`L4Filter`]: the compiled policy for one port range, protocol and
//!   direction
//! - [`L4PolicyMap`]: filters keyed by exact port range, overlaps allowed
//! - [`L4Policy`]: a shared policy with its subscribed endpoints
//! - [`EndpointPolicy`]: one endpoint's [`MapState`] and pending deltas
//!
//! # Synchronization
//!
//! Selector updates and filter changes flow through three steps:
//!
//! 1. `accumulate_map_changes` buffers per-endpoint deltas for a filter
//! 2. `sync_map_changes` makes them visible, tagged with the selector
//!    cache version they were computed against
//! 3. each endpoint calls [`EndpointPolicy::consume_map_changes`] and
//!    releases the returned handle once the changes are applied
//!
//! Applying every delta in order yields the same map state as a full
//! rebuild from the final selections.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use policy_engine::{CachedSelector, L4Filter, L4Policy, SelectorCache, StaticPolicyOwner};
//! use policy_types::{NumericIdentity, PortRange, Protocol};
//!
//! let cache = Arc::new(SelectorCache::new());
//! let policy = L4Policy::new(Arc::clone(&cache));
//! let web = CachedSelector::new("app=web");
//! policy.upsert_filter(
//!     L4Filter::new(PortRange::single(80), Protocol::Tcp, true).with_policy(web.clone(), None),
//! );
//!
//! let endpoint = policy.register(Arc::new(StaticPolicyOwner::new(1)));
//! let update = cache.update(&web, &[NumericIdentity::new(1001)], &[]);
//! policy.on_selections_changed(&update);
//!
//! let handle = endpoint.consume_map_changes().unwrap();
//! assert_eq!(handle.map_state().len(), 1);
//! handle.release();
//! ```

mod endpoint_policy;
mod error;
mod l4_filter;
mod l4_map;
mod l4_policy;
mod l7_parser;
mod map_changes;
mod map_state;
mod per_selector;
mod proxy_id;
mod rules;
mod selector;

pub use endpoint_policy::{EndpointPolicy, MapChangesHandle, PolicyOwner, StaticPolicyOwner};
pub use error::{PolicyError, Result, SyncError};
pub use l4_filter::{FilterKey, L4Filter};
pub use l4_map::L4PolicyMap;
pub use l4_policy::{L4DirectionPolicy, L4Policy, PolicyModel, PolicyRuleModel};
pub use l7_parser::L7ParserType;
pub use map_changes::{FilterDelta, MapChanges, SyncOutcome, SyncSummary};
pub use map_state::{ChangeState, EntryValue, Key, MapState, MapStateEntry};
pub use per_selector::{
    merge_per_selector, AuthType, L7DataMap, PerSelectorPolicy, RedirectTypes,
    SecretResolver, StaticSecrets, TlsSecret,
};
pub use proxy_id::{parse_proxy_id, proxy_id, ParsedProxyId};
pub use rules::{
    Authentication, AuthenticationMode, L7Rules, Listener, PortProtocol, PortRule, PortRuleDns,
    PortRuleHttp, PortRuleKafka, PortRuleL7, Secret, TlsContext,
};
pub use selector::{CachedSelector, SelectionSnapshot, SelectionUpdate, SelectorCache};
