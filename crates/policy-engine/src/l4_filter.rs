//! L4 filters: the compiled enforcement unit for one port range, protocol
//! and direction.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use policy_types::{NumericIdentity, PortRange, Protocol, TrafficDirection};
use tracing::debug;

use crate::endpoint_policy::PolicyOwner;
use crate::error::{PolicyError, Result};
use crate::l7_parser::L7ParserType;
use crate::map_changes::FilterDelta;
use crate::map_state::{ChangeState, EntryValue, Key, MapState};
use crate::per_selector::{
    merge_per_selector, L7DataMap, PerSelectorPolicy, RedirectTypes, SecretResolver, TlsSecret,
};
use crate::rules::{Authentication, PortProtocol, PortRule, TlsContext};
use crate::selector::{CachedSelector, SelectionSnapshot};

/// Identifies a filter within a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterKey {
    pub direction: TrafficDirection,
    pub protocol: Protocol,
    pub ports: PortRange,
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.ports, self.protocol, self.direction)
    }
}

/// Policy for one port range, protocol and direction.
///
/// Each selector maps to its L7 policy, or to `None` when traffic from
/// that selector is allowed without L7 restrictions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L4Filter {
    pub ports: PortRange,
    pub protocol: Protocol,
    pub ingress: bool,
    /// The wildcard selector, if any selector of this filter selects
    /// every peer.
    pub wildcard: Option<CachedSelector>,
    pub per_selector_policies: L7DataMap,
}

impl L4Filter {
    /// Creates a filter with no selectors.
    pub fn new(ports: PortRange, protocol: Protocol, ingress: bool) -> Self {
        Self {
            ports,
            protocol,
            ingress,
            wildcard: None,
            per_selector_policies: L7DataMap::new(),
        }
    }

    /// Builds the filter for one port of a port rule.
    ///
    /// Every peer selector gets the same L7 policy. Fails if the rule's L7
    /// parts cannot coexist or a referenced TLS secret is missing.
    pub fn create(
        resolver: &dyn SecretResolver,
        peers: &[CachedSelector],
        auth: Option<&Authentication>,
        rule: &PortRule,
        port: &PortProtocol,
        ingress: bool,
    ) -> Result<Self> {
        let ports = PortRange::new(port.port, port.end_port).map_err(|_| {
            PolicyError::InvalidPortRange {
                start: port.port,
                end: port.end_port,
            }
        })?;

        let policy = build_policy(resolver, auth, rule)?;
        if policy.as_ref().is_some_and(|p| p.is_redirect()) && !port.protocol.supports_l7() {
            return Err(PolicyError::L7NotSupported {
                protocol: port.protocol,
                range: ports,
            });
        }

        let policy = policy.map(Arc::new);
        let mut filter = L4Filter::new(ports, port.protocol, ingress);
        for peer in peers {
            filter.add_selector(peer.clone(), policy.clone())?;
        }
        Ok(filter)
    }

    /// Sets the policy of `selector`, replacing any previous one.
    pub fn with_policy(mut self, selector: CachedSelector, policy: Option<PerSelectorPolicy>) -> Self {
        if selector.is_wildcard() {
            self.wildcard = Some(selector.clone());
        }
        self.per_selector_policies
            .insert(selector, policy.map(Arc::new));
        self
    }

    pub fn key(&self) -> FilterKey {
        FilterKey {
            direction: self.direction(),
            protocol: self.protocol,
            ports: self.ports,
        }
    }

    pub fn direction(&self) -> TrafficDirection {
        TrafficDirection::from_ingress(self.ingress)
    }

    /// Returns the selectors of this filter.
    pub fn selectors(&self) -> impl Iterator<Item = &CachedSelector> {
        self.per_selector_policies.keys()
    }

    /// Returns true if `selector` is one of this filter's selectors.
    pub fn has_selector(&self, selector: &CachedSelector) -> bool {
        self.per_selector_policies.contains_key(selector)
    }

    /// Adds a selector, merging with its existing policy if present.
    fn add_selector(
        &mut self,
        selector: CachedSelector,
        policy: Option<Arc<PerSelectorPolicy>>,
    ) -> Result<()> {
        if selector.is_wildcard() {
            self.wildcard = Some(selector.clone());
        }
        match self.per_selector_policies.get(&selector) {
            Some(existing) => {
                let merged = merge_per_selector(&selector, existing.as_ref(), policy.as_ref())?;
                self.per_selector_policies.insert(selector, merged);
            }
            None => {
                self.per_selector_policies.insert(selector, policy);
            }
        }
        Ok(())
    }

    /// Merges another filter for the same key into this one.
    ///
    /// On error this filter is left unchanged.
    pub fn merge(&mut self, other: &L4Filter) -> Result<()> {
        debug_assert_eq!(self.key(), other.key());

        let mut merged = self.clone();
        for (selector, policy) in &other.per_selector_policies {
            merged.add_selector(selector.clone(), policy.clone())?;
        }
        *self = merged;
        Ok(())
    }

    /// Returns the union of the redirect types of all selectors.
    pub fn redirect_type(&self) -> RedirectTypes {
        self.per_selector_policies
            .values()
            .flatten()
            .fold(RedirectTypes::NONE, |acc, p| acc | p.redirect_type())
    }

    /// Returns the L7 parsers used by this filter.
    pub fn l7_parsers(&self) -> BTreeSet<L7ParserType> {
        self.per_selector_policies
            .values()
            .flatten()
            .map(|p| p.l7_parser.clone())
            .filter(|p| !p.is_none())
            .collect()
    }

    /// Computes the value a selector's policy contributes for `owner`.
    pub fn entry_value(
        &self,
        policy: Option<&PerSelectorPolicy>,
        owner: &dyn PolicyOwner,
    ) -> EntryValue {
        let Some(policy) = policy else {
            return EntryValue::default();
        };
        let (_, auth_type) = policy.get_auth_type();
        let mut proxy_port = 0;
        if policy.is_redirect() {
            match owner.lookup_redirect_port(
                self.ingress,
                self.protocol,
                self.ports.start(),
                &policy.listener,
            ) {
                Some(port) => proxy_port = port,
                None => debug!(
                    endpoint = owner.endpoint_id(),
                    filter = %self.key(),
                    "No redirect port allocated yet"
                ),
            }
        }
        EntryValue {
            proxy_port,
            auth_type,
        }
    }

    /// Inserts this filter's entries for `owner` into `map_state`.
    pub fn to_map_state(
        &self,
        owner: &dyn PolicyOwner,
        snapshot: &SelectionSnapshot,
        map_state: &mut MapState,
        changes: &mut ChangeState,
    ) {
        let key = self.key();
        for (selector, policy) in &self.per_selector_policies {
            let value = self.entry_value(policy.as_deref(), owner);
            for identity in snapshot.selections(selector) {
                map_state.insert_owner(Key::new(identity, &key), selector.clone(), value, changes);
            }
        }
    }

    /// Builds a delta that replaces every entry of this filter.
    pub(crate) fn reset_delta(&self, owner: &dyn PolicyOwner, snapshot: &SelectionSnapshot) -> FilterDelta {
        let mut delta = FilterDelta::new();
        delta.mark_reset();
        for (selector, policy) in &self.per_selector_policies {
            let value = self.entry_value(policy.as_deref(), owner);
            for identity in snapshot.selections(selector) {
                delta.push_insert((selector.clone(), identity), value);
            }
        }
        delta
    }

    /// Builds the delta for identities that started or stopped matching
    /// `selector`.
    ///
    /// Returns `None` for wildcard selectors and selectors this filter
    /// does not have.
    pub(crate) fn selection_delta(
        &self,
        owner: &dyn PolicyOwner,
        selector: &CachedSelector,
        added: &[NumericIdentity],
        deleted: &[NumericIdentity],
    ) -> Option<FilterDelta> {
        if selector.is_wildcard() {
            return None;
        }
        let policy = self.per_selector_policies.get(selector)?;
        let value = self.entry_value(policy.as_deref(), owner);

        let mut delta = FilterDelta::new();
        for identity in deleted {
            delta.push_delete((selector.clone(), *identity));
        }
        for identity in added {
            delta.push_insert((selector.clone(), *identity), value);
        }
        Some(delta)
    }
}

fn build_policy(
    resolver: &dyn SecretResolver,
    auth: Option<&Authentication>,
    rule: &PortRule,
) -> Result<Option<PerSelectorPolicy>> {
    let l7_rules = rule.rules.clone().unwrap_or_default();
    let mut l7_parser = l7_rules.parser_type()?;

    let terminating_tls = resolve_tls(resolver, rule.terminating_tls.as_ref())?;
    let originating_tls = resolve_tls(resolver, rule.originating_tls.as_ref())?;
    if terminating_tls.is_some() || originating_tls.is_some() {
        l7_parser = L7ParserType::Tls.merge(&l7_parser)?;
    }

    let mut listener = String::new();
    if let Some(l) = &rule.listener {
        l7_parser = match l7_parser {
            L7ParserType::None | L7ParserType::Tls => L7ParserType::Crd,
            other => {
                return Err(PolicyError::ParserConflict {
                    a: other,
                    b: L7ParserType::Crd,
                })
            }
        };
        listener = l.qualified_name();
    }

    let policy = PerSelectorPolicy {
        terminating_tls,
        originating_tls,
        listener,
        authentication: auth.copied(),
        l7_parser,
        l7_rules,
    };
    if policy == PerSelectorPolicy::default() {
        return Ok(None);
    }
    Ok(Some(policy))
}

fn resolve_tls(resolver: &dyn SecretResolver, ctx: Option<&TlsContext>) -> Result<Option<TlsSecret>> {
    let Some(ctx) = ctx else {
        return Ok(None);
    };
    resolver
        .resolve(&ctx.secret)
        .map(Some)
        .ok_or_else(|| PolicyError::MissingTlsSecret(ctx.secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_policy::StaticPolicyOwner;
    use crate::per_selector::{AuthType, StaticSecrets};
    use crate::rules::{L7Rules, Listener, PortRuleDns, PortRuleHttp, Secret};
    use pretty_assertions::assert_eq;

    fn http_rule() -> PortRule {
        PortRule {
            ports: vec![PortProtocol::new(80, Protocol::Tcp)],
            rules: Some(L7Rules {
                http: vec![PortRuleHttp {
                    path: "/public".to_string(),
                    method: "GET".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_l4_filter_with_http() {
        let secrets = StaticSecrets::new();
        let rule = http_rule();
        let port = rule.ports[0];

        let filter = L4Filter::create(&secrets, &[CachedSelector::new("foo")], None, &rule, &port, true)
            .unwrap();
        assert_eq!(filter.key().ports, PortRange::single(80));
        assert_eq!(filter.redirect_type(), RedirectTypes::ENVOY);
        assert!(filter.wildcard.is_none());
    }

    #[test]
    fn test_invalid_port_range() {
        let secrets = StaticSecrets::new();
        let rule = PortRule::default();
        let port = PortProtocol::range(1024, 80, Protocol::Tcp);

        let err = L4Filter::create(&secrets, &[], None, &rule, &port, true).unwrap_err();
        assert_eq!(err, PolicyError::InvalidPortRange { start: 1024, end: 80 });
    }

    #[test]
    fn test_tls_only_rule_is_tls_parser() {
        let secret = Secret::new("default", "cert");
        let mut secrets = StaticSecrets::new();
        secrets.insert(TlsSecret {
            secret: secret.clone(),
            ..Default::default()
        });
        let rule = PortRule {
            ports: vec![PortProtocol::new(443, Protocol::Tcp)],
            terminating_tls: Some(TlsContext { secret }),
            ..Default::default()
        };

        let filter = L4Filter::create(&secrets, &[CachedSelector::new("foo")], None, &rule, &rule.ports[0], false)
            .unwrap();
        assert_eq!(filter.l7_parsers(), BTreeSet::from([L7ParserType::Tls]));
    }

    #[test]
    fn test_listener_with_l7_rules_conflicts() {
        let mut rule = http_rule();
        rule.listener = Some(Listener {
            envoy_config: "cec".to_string(),
            name: "l1".to_string(),
        });

        let err = L4Filter::create(&StaticSecrets::new(), &[], None, &rule, &rule.ports[0], true)
            .unwrap_err();
        assert!(matches!(err, PolicyError::ParserConflict { .. }));
    }

    #[test]
    fn test_l7_on_icmp_rejected() {
        let mut rule = http_rule();
        rule.ports = vec![PortProtocol::new(0, Protocol::Icmp)];

        let err = L4Filter::create(&StaticSecrets::new(), &[], None, &rule, &rule.ports[0], true)
            .unwrap_err();
        assert!(matches!(err, PolicyError::L7NotSupported { .. }));
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let foo = CachedSelector::new("foo");
        let bar = CachedSelector::new("bar");
        let dns = PerSelectorPolicy {
            l7_parser: L7ParserType::Dns,
            l7_rules: L7Rules {
                dns: vec![PortRuleDns::name("example.com")],
                ..Default::default()
            },
            ..Default::default()
        };
        let http = PerSelectorPolicy {
            l7_parser: L7ParserType::Http,
            l7_rules: http_rule().rules.unwrap(),
            ..Default::default()
        };

        let mut filter = L4Filter::new(PortRange::single(53), Protocol::Udp, false)
            .with_policy(foo.clone(), Some(dns));
        let other = L4Filter::new(PortRange::single(53), Protocol::Udp, false)
            .with_policy(bar, None)
            .with_policy(foo, Some(http));
        let before = filter.clone();

        assert!(filter.merge(&other).is_err());
        assert_eq!(filter, before);
    }

    #[test]
    fn test_to_map_state_uses_redirect_port() {
        let cache = crate::selector::SelectorCache::new();
        let foo = CachedSelector::new("foo");
        let wildcard = CachedSelector::wildcard("all");
        cache.update(&foo, &[NumericIdentity::new(101), NumericIdentity::new(102)], &[]);

        let rule = http_rule();
        let filter = L4Filter::create(&StaticSecrets::new(), &[foo.clone()], None, &rule, &rule.ports[0], true)
            .unwrap()
            .with_policy(wildcard, None);

        let mut owner = StaticPolicyOwner::new(7);
        owner.set_redirect(true, Protocol::Tcp, 80, "", 15001);

        let mut state = MapState::new();
        let mut changes = ChangeState::default();
        filter.to_map_state(&owner, &cache.snapshot(), &mut state, &mut changes);

        let key = |id: u32| Key::new(NumericIdentity::new(id), &filter.key());
        assert_eq!(state.len(), 3);
        assert_eq!(state.get(&key(101)).map(|v| v.proxy_port), Some(15001));
        assert_eq!(state.get(&key(0)), Some(EntryValue::default()));
        assert_eq!(
            state.get(&key(102)).map(|v| v.auth_type),
            Some(AuthType::Disabled)
        );
    }
}
