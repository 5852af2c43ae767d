//! Per-selector L7 policy and the values derived from it.

use bitflags::bitflags;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{PolicyError, Result};
use crate::l7_parser::L7ParserType;
use crate::rules::{Authentication, AuthenticationMode, L7Rules, Secret};
use crate::selector::CachedSelector;

bitflags! {
    /// Proxy kinds a filter may redirect traffic to.
    ///
    /// Proxylib runs inside Envoy, so `PROXYLIB` includes `ENVOY`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct RedirectTypes: u8 {
        const DNS = 0x1;
        const ENVOY = 0x2;
        const PROXYLIB = 0x4 | Self::ENVOY.bits();
    }
}

impl RedirectTypes {
    pub const NONE: RedirectTypes = RedirectTypes::empty();
}

/// Authentication type enforced for a map-state entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    #[default]
    Disabled,
    Spire,
    AlwaysFail,
}

impl From<AuthenticationMode> for AuthType {
    fn from(mode: AuthenticationMode) -> Self {
        match mode {
            AuthenticationMode::Disabled => AuthType::Disabled,
            AuthenticationMode::Required => AuthType::Spire,
            AuthenticationMode::TestAlwaysFail => AuthType::AlwaysFail,
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Disabled => write!(f, "disabled"),
            AuthType::Spire => write!(f, "spire"),
            AuthType::AlwaysFail => write!(f, "test-always-fail"),
        }
    }
}

/// TLS material resolved from a [`Secret`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSecret {
    pub secret: Secret,
    pub certificate_chain: String,
    pub private_key: String,
    pub trusted_ca: String,
}

/// Looks up TLS secrets referenced by rules.
pub trait SecretResolver: Send + Sync {
    /// Returns the secret material, or `None` if it does not exist.
    fn resolve(&self, secret: &Secret) -> Option<TlsSecret>;
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<Secret, TlsSecret>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tls: TlsSecret) {
        self.secrets.insert(tls.secret.clone(), tls);
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve(&self, secret: &Secret) -> Option<TlsSecret> {
        self.secrets.get(secret).cloned()
    }
}

/// L7 policy applying to traffic from one selector on one port.
///
/// Instances are immutable once built; merging produces a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerSelectorPolicy {
    pub terminating_tls: Option<TlsSecret>,
    pub originating_tls: Option<TlsSecret>,
    /// Qualified Envoy listener name, empty if none.
    pub listener: String,
    pub authentication: Option<Authentication>,
    pub l7_parser: L7ParserType,
    pub l7_rules: L7Rules,
}

impl PerSelectorPolicy {
    /// Returns the proxy kind this policy redirects to.
    pub fn redirect_type(&self) -> RedirectTypes {
        self.l7_parser.redirect_type()
    }

    /// Returns true if traffic must be redirected to a proxy.
    pub fn is_redirect(&self) -> bool {
        !self.redirect_type().is_empty()
    }

    /// Returns whether authentication was set explicitly, and its type.
    pub fn get_auth_type(&self) -> (bool, AuthType) {
        match self.authentication {
            Some(auth) => (true, auth.mode.into()),
            None => (false, AuthType::Disabled),
        }
    }

    /// Merges two policies for the same selector.
    pub fn merge(&self, other: &PerSelectorPolicy, selector: &CachedSelector) -> Result<Self> {
        let l7_parser = self.l7_parser.merge(&other.l7_parser)?;

        let terminating_tls = merge_same(&self.terminating_tls, &other.terminating_tls)
            .ok_or_else(|| PolicyError::TlsConflict(selector.to_string()))?;
        let originating_tls = merge_same(&self.originating_tls, &other.originating_tls)
            .ok_or_else(|| PolicyError::TlsConflict(selector.to_string()))?;
        let authentication = merge_same(&self.authentication, &other.authentication)
            .ok_or_else(|| PolicyError::AuthConflict(selector.to_string()))?;

        let listener = match (self.listener.as_str(), other.listener.as_str()) {
            ("", b) => b.to_string(),
            (a, "") => a.to_string(),
            (a, b) if a == b => a.to_string(),
            _ => return Err(PolicyError::ListenerConflict(selector.to_string())),
        };

        let mut l7_rules = self.l7_rules.clone();
        l7_rules.merge(&other.l7_rules);
        if l7_parser.has_rules() && (self.l7_rules.is_empty() || other.l7_rules.is_empty()) {
            l7_rules.add_wildcard(&l7_parser);
        }

        Ok(Self {
            terminating_tls,
            originating_tls,
            listener,
            authentication,
            l7_parser,
            l7_rules,
        })
    }

    fn allowing_all(self: &Arc<Self>) -> Arc<Self> {
        if !self.l7_parser.has_rules() {
            return Arc::clone(self);
        }
        let mut policy = (**self).clone();
        policy.l7_rules.add_wildcard(&self.l7_parser);
        Arc::new(policy)
    }
}

/// L7 policy per selector. `None` allows all traffic at L7.
pub type L7DataMap = BTreeMap<CachedSelector, Option<Arc<PerSelectorPolicy>>>;

/// Merges the policies two rules give the same selector.
///
/// A selector without L7 policy allows everything, so merging it into one
/// that restricts L7 adds an allow-all rule instead of narrowing it.
pub fn merge_per_selector(
    selector: &CachedSelector,
    a: Option<&Arc<PerSelectorPolicy>>,
    b: Option<&Arc<PerSelectorPolicy>>,
) -> Result<Option<Arc<PerSelectorPolicy>>> {
    match (a, b) {
        (None, None) => Ok(None),
        (Some(p), None) | (None, Some(p)) => Ok(Some(p.allowing_all())),
        (Some(a), Some(b)) if Arc::ptr_eq(a, b) => Ok(Some(Arc::clone(a))),
        (Some(a), Some(b)) => Ok(Some(Arc::new(a.merge(b, selector)?))),
    }
}

/// Returns the common value, or `None` if both sides are set and differ.
fn merge_same<T: Clone + PartialEq>(a: &Option<T>, b: &Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => None,
        (Some(x), _) | (None, Some(x)) => Some(Some(x.clone())),
        (None, None) => Some(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::PortRuleHttp;
    use pretty_assertions::assert_eq;

    fn http_policy(path: &str) -> PerSelectorPolicy {
        PerSelectorPolicy {
            l7_parser: L7ParserType::Http,
            l7_rules: L7Rules {
                http: vec![PortRuleHttp {
                    path: path.to_string(),
                    method: "GET".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_redirect_type_bits() {
        assert_eq!(RedirectTypes::NONE.bits(), 0);
        assert_eq!(RedirectTypes::DNS.bits(), 0x1);
        assert_eq!(RedirectTypes::ENVOY.bits(), 0x2);
        assert_eq!(
            RedirectTypes::from_bits_retain(0x4) | RedirectTypes::ENVOY,
            RedirectTypes::PROXYLIB
        );
        assert_eq!(
            RedirectTypes::PROXYLIB & RedirectTypes::ENVOY,
            RedirectTypes::ENVOY
        );
    }

    #[test]
    fn test_auth_type() {
        let mut policy = http_policy("/");
        assert_eq!(policy.get_auth_type(), (false, AuthType::Disabled));

        policy.authentication = Some(Authentication::new(AuthenticationMode::Disabled));
        assert_eq!(policy.get_auth_type(), (true, AuthType::Disabled));

        policy.authentication = Some(Authentication::new(AuthenticationMode::Required));
        assert_eq!(policy.get_auth_type(), (true, AuthType::Spire));

        policy.authentication = Some(Authentication::new(AuthenticationMode::TestAlwaysFail));
        assert_eq!(policy.get_auth_type(), (true, AuthType::AlwaysFail));
    }

    #[test]
    fn test_merge_unions_rules() {
        let sel = CachedSelector::new("foo");
        let merged = http_policy("/a").merge(&http_policy("/b"), &sel).unwrap();

        assert_eq!(merged.l7_parser, L7ParserType::Http);
        assert_eq!(merged.l7_rules.http.len(), 2);
    }

    #[test]
    fn test_merge_nil_adds_wildcard() {
        let sel = CachedSelector::new("foo");
        let restricted = Arc::new(http_policy("/a"));

        let merged = merge_per_selector(&sel, Some(&restricted), None)
            .unwrap()
            .unwrap();
        assert_eq!(merged.l7_rules.http.len(), 2);
        assert!(merged.l7_rules.http.contains(&PortRuleHttp::default()));

        assert_eq!(merge_per_selector(&sel, None, None), Ok(None));
    }

    #[test]
    fn test_merge_auth_only_with_http_allows_all() {
        let sel = CachedSelector::new("foo");
        let auth_only = PerSelectorPolicy {
            authentication: Some(Authentication::new(AuthenticationMode::Required)),
            ..Default::default()
        };
        let merged = auth_only.merge(&http_policy("/a"), &sel).unwrap();

        assert_eq!(merged.get_auth_type(), (true, AuthType::Spire));
        assert!(merged.l7_rules.http.contains(&PortRuleHttp::default()));
    }

    #[test]
    fn test_merge_conflicts() {
        let sel = CachedSelector::new("foo");

        let mut a = http_policy("/");
        a.authentication = Some(Authentication::new(AuthenticationMode::Required));
        let mut b = http_policy("/");
        b.authentication = Some(Authentication::new(AuthenticationMode::Disabled));
        assert_eq!(
            a.merge(&b, &sel),
            Err(PolicyError::AuthConflict("foo".to_string()))
        );

        let mut a = http_policy("/");
        a.listener = "cec/one".to_string();
        let mut b = http_policy("/");
        b.listener = "cec/two".to_string();
        assert_eq!(
            a.merge(&b, &sel),
            Err(PolicyError::ListenerConflict("foo".to_string()))
        );

        let dns = PerSelectorPolicy {
            l7_parser: L7ParserType::Dns,
            ..Default::default()
        };
        assert!(matches!(
            dns.merge(&http_policy("/"), &sel),
            Err(PolicyError::ParserConflict { .. })
        ));
    }
}
