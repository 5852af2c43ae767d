//! DNS L7 rule compiler.
//!
//! DNS rules of a policy are compiled into one anchored regex per
//! selector and installed per (endpoint, port, protocol) scope:
//!
//! - [`generate_pattern`]: turns `matchName`/`matchPattern` rules into a
//!   regex source
//! - [`RegexCache`]: compiled patterns shared by source text and
//!   reference counted
//! - [`PerEpAllow`]: the scopes of all endpoints
//! - [`DnsRules`]: locked store queried by the proxy
//!
//! A scope whose rules fail to compile is left empty and denies every
//! query.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dnsproxy::DnsRules;
//! use policy_engine::{CachedSelector, L7DataMap, L7Rules, PerSelectorPolicy, PortRuleDns};
//! use policy_types::{PortProto, Protocol};
//!
//! let selector = CachedSelector::new("k8s-app=kube-dns");
//! let policy = PerSelectorPolicy {
//!     l7_rules: L7Rules { dns: vec![PortRuleDns::pattern("*.acme.io")], ..Default::default() },
//!     ..Default::default()
//! };
//! let mut rules = L7DataMap::new();
//! rules.insert(selector.clone(), Some(Arc::new(policy)));
//!
//! let dns = DnsRules::new();
//! let scope = PortProto::new(53, Protocol::Udp);
//! dns.update_allowed(7, scope, Some(&rules)).unwrap();
//!
//! assert!(dns.check_allowed(7, scope, "docs.acme.io", |s| *s == selector));
//! assert!(!dns.check_allowed(7, scope, "example.com", |s| *s == selector));
//! ```

mod error;
mod pattern;
mod per_ep_allow;
mod regex_cache;
mod rules;

pub use error::{DnsProxyError, Result};
pub use pattern::{fqdn, generate_pattern, normalize_name, MATCH_ALL};
pub use per_ep_allow::{PerEpAllow, SelectorRegexMap};
pub use regex_cache::RegexCache;
pub use rules::DnsRules;
