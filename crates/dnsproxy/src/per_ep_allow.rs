//! Per-endpoint DNS allow-lists.

use crate::error::Result;
use crate::pattern::{generate_pattern, normalize_name};
use crate::regex_cache::RegexCache;
use policy_engine::{CachedSelector, L7DataMap};
use policy_types::{EndpointId, PortProto};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiled pattern of each selector in one scope.
pub type SelectorRegexMap = BTreeMap<CachedSelector, Arc<Regex>>;

/// Compiled DNS rules per (endpoint, port, protocol) scope.
///
/// A scope is replaced wholesale on every update and removed when its
/// rule set becomes empty. A missing scope allows nothing.
#[derive(Debug, Default)]
pub struct PerEpAllow {
    endpoints: BTreeMap<EndpointId, BTreeMap<PortProto, SelectorRegexMap>>,
}

impl PerEpAllow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled rules of a scope.
    pub fn get(&self, endpoint: EndpointId, port_proto: PortProto) -> Option<&SelectorRegexMap> {
        self.endpoints.get(&endpoint)?.get(&port_proto)
    }

    /// Returns the installed scopes of `endpoint`.
    pub fn scopes(&self, endpoint: EndpointId) -> Vec<PortProto> {
        self.endpoints
            .get(&endpoint)
            .map(|scopes| scopes.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true if no scope is installed.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Replaces the rules of a scope with the DNS rules of `rules`.
    ///
    /// A selector without a policy allows every name. If any selector's
    /// pattern fails to compile the scope is left empty, so every query
    /// on it is denied, and the error is returned.
    pub fn set_port_rules_for_id(
        &mut self,
        cache: &mut RegexCache,
        endpoint: EndpointId,
        port_proto: PortProto,
        rules: Option<&L7DataMap>,
    ) -> Result<()> {
        let mut compiled = SelectorRegexMap::new();
        let mut failure = None;
        for (selector, policy) in rules.into_iter().flatten() {
            let dns = policy.as_deref().map_or(&[][..], |p| p.l7_rules.dns.as_slice());
            match cache.lookup_or_compile(&generate_pattern(dns)) {
                Ok(regex) => {
                    compiled.insert(selector.clone(), regex);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.remove_scope(cache, endpoint, port_proto);

        if let Some(e) = failure {
            release_all(cache, &compiled);
            warn!(
                endpoint,
                port_proto = %port_proto,
                error = %e,
                "Invalid DNS rules, denying all queries"
            );
            return Err(e);
        }
        self.install(endpoint, port_proto, compiled);
        Ok(())
    }

    /// Replaces the rules of a scope with precompiled regexes, as restored
    /// from a previous run.
    pub fn set_port_rules_for_id_from_unified_format(
        &mut self,
        cache: &mut RegexCache,
        endpoint: EndpointId,
        port_proto: PortProto,
        rules: Option<&BTreeMap<CachedSelector, Regex>>,
    ) {
        let compiled: SelectorRegexMap = rules
            .into_iter()
            .flatten()
            .map(|(selector, regex)| (selector.clone(), cache.lookup_or_insert(regex)))
            .collect();

        self.remove_scope(cache, endpoint, port_proto);
        self.install(endpoint, port_proto, compiled);
    }

    /// Drops every scope of an endpoint.
    pub fn remove_endpoint(&mut self, cache: &mut RegexCache, endpoint: EndpointId) {
        if let Some(scopes) = self.endpoints.remove(&endpoint) {
            for rules in scopes.values() {
                release_all(cache, rules);
            }
            debug!(endpoint, "Removed DNS rules of endpoint");
        }
    }

    /// Returns true if `name` may be resolved by `endpoint` on `port_proto`.
    ///
    /// `selects` tells whether a selector selects the queried server.
    pub fn check_allowed<F>(&self, endpoint: EndpointId, port_proto: PortProto, name: &str, selects: F) -> bool
    where
        F: Fn(&CachedSelector) -> bool,
    {
        let Some(rules) = self.get(endpoint, port_proto) else {
            return false;
        };
        let name = normalize_name(name);
        rules
            .iter()
            .any(|(selector, regex)| selects(selector) && regex.is_match(&name))
    }

    fn install(&mut self, endpoint: EndpointId, port_proto: PortProto, compiled: SelectorRegexMap) {
        if compiled.is_empty() {
            return;
        }
        self.endpoints
            .entry(endpoint)
            .or_default()
            .insert(port_proto, compiled);
    }

    fn remove_scope(&mut self, cache: &mut RegexCache, endpoint: EndpointId, port_proto: PortProto) {
        let Some(scopes) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        if let Some(old) = scopes.remove(&port_proto) {
            release_all(cache, &old);
        }
        if scopes.is_empty() {
            self.endpoints.remove(&endpoint);
        }
    }
}

fn release_all(cache: &mut RegexCache, rules: &SelectorRegexMap) {
    for regex in rules.values() {
        cache.release(regex.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::{L7Rules, PerSelectorPolicy, PortRuleDns};
    use policy_types::Protocol;
    use pretty_assertions::assert_eq;

    const EP: EndpointId = 1;

    fn udp_8053() -> PortProto {
        PortProto::new(8053, Protocol::Udp)
    }

    fn dns_policy(rules: Vec<PortRuleDns>) -> Option<Arc<PerSelectorPolicy>> {
        Some(Arc::new(PerSelectorPolicy {
            l7_rules: L7Rules {
                dns: rules,
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    #[test]
    fn test_set_port_rules_for_id() {
        let mut cache = RegexCache::new();
        let mut allow = PerEpAllow::new();
        let selector1 = CachedSelector::new("selector1");
        let selector2 = CachedSelector::new("selector2");

        let mut rules = L7DataMap::new();
        rules.insert(
            selector1.clone(),
            dns_policy(vec![PortRuleDns::name("acme.io."), PortRuleDns::pattern("*.acme.io.")]),
        );
        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules)).unwrap();
        assert_eq!(cache.len(), 1);

        rules.insert(
            selector2.clone(),
            dns_policy(vec![
                PortRuleDns::name("acme2.io."),
                PortRuleDns::pattern("*.acme2.io."),
                PortRuleDns::pattern("*.acme3.io."),
            ]),
        );
        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules)).unwrap();
        assert_eq!(cache.len(), 2);

        rules.remove(&selector2);
        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules)).unwrap();
        assert_eq!(cache.len(), 1);

        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), None).unwrap();
        assert_eq!(cache.len(), 0);
        assert!(allow.is_empty());

        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules)).unwrap();
        assert_eq!(cache.len(), 1);
        rules.insert(
            selector2,
            dns_policy(vec![
                PortRuleDns::name("acme2.io."),
                PortRuleDns::pattern("-invalid-pattern("),
                PortRuleDns::pattern("*.acme2.io."),
            ]),
        );
        let err = allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules));
        assert!(err.is_err());
        assert_eq!(cache.len(), 0);
        assert!(allow.get(EP, udp_8053()).is_none());
    }

    #[test]
    fn test_set_port_rules_for_id_from_unified_format() {
        let mut cache = RegexCache::new();
        let mut allow = PerEpAllow::new();
        let selector1 = CachedSelector::new("selector1");
        let selector2 = CachedSelector::new("selector2");

        let mut rules = BTreeMap::new();
        rules.insert(selector1.clone(), Regex::new("^.*[.]acme[.]io$").unwrap());
        rules.insert(selector2.clone(), Regex::new("^.*[.]acme[.]io$").unwrap());
        allow.set_port_rules_for_id_from_unified_format(&mut cache, EP, udp_8053(), Some(&rules));
        assert_eq!(cache.len(), 1);

        rules.insert(selector2.clone(), Regex::new("^sub[.]acme[.]io").unwrap());
        allow.set_port_rules_for_id_from_unified_format(&mut cache, EP, udp_8053(), Some(&rules));
        assert_eq!(cache.len(), 2);

        rules.remove(&selector2);
        allow.set_port_rules_for_id_from_unified_format(&mut cache, EP, udp_8053(), Some(&rules));
        assert_eq!(cache.len(), 1);

        allow.set_port_rules_for_id_from_unified_format(&mut cache, EP, udp_8053(), None);
        assert_eq!(cache.len(), 0);

        allow.set_port_rules_for_id_from_unified_format(&mut cache, EP, udp_8053(), Some(&rules));
        assert_eq!(cache.len(), 1);
        allow.set_port_rules_for_id_from_unified_format(&mut cache, EP, udp_8053(), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_check_allowed() {
        let mut cache = RegexCache::new();
        let mut allow = PerEpAllow::new();
        let web = CachedSelector::new("web");
        let any = CachedSelector::new("any");

        let mut rules = L7DataMap::new();
        rules.insert(web.clone(), dns_policy(vec![PortRuleDns::pattern("*.acme.io")]));
        rules.insert(any.clone(), None);
        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules)).unwrap();

        let only_web = |s: &CachedSelector| *s == web;
        assert!(allow.check_allowed(EP, udp_8053(), "Docs.Acme.IO", only_web));
        assert!(!allow.check_allowed(EP, udp_8053(), "example.com", only_web));
        // A selector without DNS rules allows every name.
        assert!(allow.check_allowed(EP, udp_8053(), "example.com", |_| true));
        // Other scopes allow nothing.
        assert!(!allow.check_allowed(EP, PortProto::new(53, Protocol::Udp), "docs.acme.io", |_| true));
        assert!(!allow.check_allowed(2, udp_8053(), "docs.acme.io", |_| true));
    }

    #[test]
    fn test_remove_endpoint_releases_patterns() {
        let mut cache = RegexCache::new();
        let mut allow = PerEpAllow::new();
        let mut rules = L7DataMap::new();
        rules.insert(CachedSelector::new("a"), dns_policy(vec![PortRuleDns::name("a.io")]));

        allow.set_port_rules_for_id(&mut cache, EP, udp_8053(), Some(&rules)).unwrap();
        allow
            .set_port_rules_for_id(&mut cache, EP, PortProto::new(53, Protocol::Udp), Some(&rules))
            .unwrap();
        allow.set_port_rules_for_id(&mut cache, 2, udp_8053(), Some(&rules)).unwrap();
        assert_eq!(cache.ref_count("^(?:a\\.io\\.)$"), Some(3));

        allow.remove_endpoint(&mut cache, EP);
        assert_eq!(cache.ref_count("^(?:a\\.io\\.)$"), Some(1));
        allow.remove_endpoint(&mut cache, 2);
        assert!(cache.is_empty());
        assert!(allow.is_empty());
    }
}
