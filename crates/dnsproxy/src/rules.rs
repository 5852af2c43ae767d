//! Locked DNS rule store used by the proxy.

use crate::error::{DnsProxyError, Result};
use crate::per_ep_allow::PerEpAllow;
use crate::regex_cache::RegexCache;
use policy_engine::{CachedSelector, L4Filter, L7DataMap, L7ParserType, PerSelectorPolicy};
use policy_types::{EndpointId, PortProto};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// DNS allow-lists of all endpoints with their shared pattern cache.
///
/// Updates take the allow-list write lock, then the cache lock. Queries
/// only take the allow-list read lock.
#[derive(Debug, Default)]
pub struct DnsRules {
    allow: RwLock<PerEpAllow>,
    cache: Mutex<RegexCache>,
}

impl DnsRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the rules of one scope. See [`PerEpAllow::set_port_rules_for_id`].
    pub fn update_allowed(
        &self,
        endpoint: EndpointId,
        port_proto: PortProto,
        rules: Option<&L7DataMap>,
    ) -> Result<()> {
        let mut allow = self.allow.write().unwrap_or_else(PoisonError::into_inner);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        allow.set_port_rules_for_id(&mut cache, endpoint, port_proto, rules)
    }

    /// Installs the DNS scopes of an endpoint from its egress filters.
    ///
    /// Every filter using the DNS parser defines a scope at its first port.
    /// The scope gets the policies of all DNS filters whose range covers
    /// that port, so filters without DNS rules never clear it. Scopes of
    /// the endpoint that no filter defines anymore are removed.
    ///
    /// Returns the scopes whose rules failed to compile. Those deny every
    /// query.
    pub fn update_from_filters<'a, I>(&self, endpoint: EndpointId, filters: I) -> Vec<(PortProto, DnsProxyError)>
    where
        I: IntoIterator<Item = &'a L4Filter>,
    {
        let wanted = dns_scopes(filters);

        let mut allow = self.allow.write().unwrap_or_else(PoisonError::into_inner);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        for stale in allow.scopes(endpoint) {
            if !wanted.contains_key(&stale) {
                debug!(endpoint, port_proto = %stale, "Removing DNS scope without rules");
                allow.set_port_rules_for_id(&mut cache, endpoint, stale, None).ok();
            }
        }

        let mut failed = Vec::new();
        for (port_proto, rules) in &wanted {
            if let Err(e) = allow.set_port_rules_for_id(&mut cache, endpoint, *port_proto, Some(rules)) {
                failed.push((*port_proto, e));
            }
        }
        failed
    }

    /// Replaces the rules of one scope with restored, precompiled regexes.
    pub fn restore_allowed(
        &self,
        endpoint: EndpointId,
        port_proto: PortProto,
        rules: Option<&BTreeMap<CachedSelector, Regex>>,
    ) {
        let mut allow = self.allow.write().unwrap_or_else(PoisonError::into_inner);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        allow.set_port_rules_for_id_from_unified_format(&mut cache, endpoint, port_proto, rules);
    }

    /// Drops every scope of an endpoint.
    pub fn remove_endpoint(&self, endpoint: EndpointId) {
        let mut allow = self.allow.write().unwrap_or_else(PoisonError::into_inner);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        allow.remove_endpoint(&mut cache, endpoint);
    }

    /// See [`PerEpAllow::check_allowed`].
    pub fn check_allowed<F>(&self, endpoint: EndpointId, port_proto: PortProto, name: &str, selects: F) -> bool
    where
        F: Fn(&CachedSelector) -> bool,
    {
        self.allow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_allowed(endpoint, port_proto, name, selects)
    }

    /// Returns the number of distinct compiled patterns.
    pub fn cached_patterns(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Groups the per-selector policies of DNS filters by scope.
fn dns_scopes<'a, I>(filters: I) -> BTreeMap<PortProto, L7DataMap>
where
    I: IntoIterator<Item = &'a L4Filter>,
{
    let dns_filters: Vec<&L4Filter> = filters
        .into_iter()
        .filter(|f| f.l7_parsers().contains(&L7ParserType::Dns))
        .collect();

    let mut scopes = BTreeMap::new();
    for filter in &dns_filters {
        let port = filter.ports.start();
        let rules: &mut L7DataMap = scopes
            .entry(PortProto::new(port, filter.protocol))
            .or_default();
        let covering = dns_filters
            .iter()
            .filter(|f| f.protocol == filter.protocol && f.ports.contains(port));
        for covering in covering {
            for (selector, policy) in &covering.per_selector_policies {
                add_selector_rules(rules, selector, policy.as_ref());
            }
        }
    }
    scopes
}

/// Unions the DNS rules of `policy` into the selector's entry.
///
/// A selector without a policy allows every name and stays that way.
fn add_selector_rules(
    rules: &mut L7DataMap,
    selector: &CachedSelector,
    policy: Option<&Arc<PerSelectorPolicy>>,
) {
    let merged = match (rules.get(selector), policy) {
        (None, policy) => policy.cloned(),
        (Some(None), _) | (Some(Some(_)), None) => None,
        (Some(Some(existing)), Some(policy)) if Arc::ptr_eq(existing, policy) => return,
        (Some(Some(existing)), Some(policy)) => {
            let mut merged = (**existing).clone();
            merged.l7_rules.merge(&policy.l7_rules);
            Some(Arc::new(merged))
        }
    };
    rules.insert(selector.clone(), merged);
}
