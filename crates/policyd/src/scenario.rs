//! Scenario files driving the daemon.
//!
//! A scenario lists endpoints, port rules, TLS secrets and a timeline of
//! selector membership changes. The selector `"*"` selects every peer.

use crate::error::{PolicydError, Result};
use policy_engine::{
    Authentication, CachedSelector, PortRule, Secret, StaticPolicyOwner, StaticSecrets, TlsSecret,
};
use policy_types::{EndpointId, NumericIdentity, Protocol, TrafficDirection};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Selector key that selects every peer.
pub const WILDCARD_SELECTOR: &str = "*";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Scenario {
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub selections: Vec<SelectionSpec>,
    #[serde(default)]
    pub dns_queries: Vec<DnsQuerySpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointSpec {
    pub id: EndpointId,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub identity: NumericIdentity,
    #[serde(default)]
    pub redirects: Vec<RedirectSpec>,
}

/// Proxy port allocated to an endpoint's L7 redirect.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedirectSpec {
    #[serde(default)]
    pub direction: TrafficDirection,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub listener: String,
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuleSpec {
    #[serde(default)]
    pub direction: TrafficDirection,
    pub peers: Vec<String>,
    #[serde(default)]
    pub authentication: Option<Authentication>,
    #[serde(flatten)]
    pub rule: PortRule,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SecretSpec {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub certificate_chain: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub trusted_ca: String,
}

/// One selector cache update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SelectionSpec {
    pub selector: String,
    #[serde(default)]
    pub added: Vec<NumericIdentity>,
    #[serde(default)]
    pub deleted: Vec<NumericIdentity>,
}

/// A DNS lookup to check against the compiled allow-lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsQuerySpec {
    pub endpoint: EndpointId,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default = "default_dns_protocol")]
    pub protocol: Protocol,
    pub name: String,
    /// Identity of the DNS server the query is sent to.
    pub server: NumericIdentity,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_protocol() -> Protocol {
    Protocol::Udp
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| PolicydError::ReadScenario {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for ep in &self.endpoints {
            if !seen.insert(ep.id) {
                return Err(PolicydError::DuplicateEndpoint(ep.id));
            }
        }
        Ok(())
    }

    pub fn secret_store(&self) -> StaticSecrets {
        let mut store = StaticSecrets::new();
        for s in &self.secrets {
            store.insert(TlsSecret {
                secret: Secret::new(s.namespace.as_str(), s.name.as_str()),
                certificate_chain: s.certificate_chain.clone(),
                private_key: s.private_key.clone(),
                trusted_ca: s.trusted_ca.clone(),
            });
        }
        store
    }
}

impl EndpointSpec {
    pub fn owner(&self) -> StaticPolicyOwner {
        let mut owner = StaticPolicyOwner::new(self.id);
        for r in &self.redirects {
            owner.set_redirect(
                r.direction.is_ingress(),
                r.protocol,
                r.port,
                &r.listener,
                r.proxy_port,
            );
        }
        owner
    }
}

impl RuleSpec {
    pub fn peer_selectors(&self) -> Vec<CachedSelector> {
        self.peers.iter().map(|p| selector(p)).collect()
    }
}

/// Returns the cached selector for a selector key.
pub fn selector(key: &str) -> CachedSelector {
    if key == WILDCARD_SELECTOR {
        CachedSelector::wildcard(key)
    } else {
        CachedSelector::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_json(
            r#"{
                "endpoints": [
                    {"id": 1, "name": "web-1", "identity": 1001,
                     "redirects": [{"port": 80, "protocol": "TCP", "proxy-port": 15001}]}
                ],
                "rules": [
                    {"direction": "ingress", "peers": ["app=client", "*"],
                     "ports": [{"port": 80, "protocol": "TCP"}],
                     "rules": {"http": [{"path": "/", "method": "GET"}]}}
                ],
                "selections": [{"selector": "app=client", "added": [2001]}],
                "dns-queries": [{"endpoint": 1, "name": "acme.io", "server": 53}]
            }"#,
        )
        .unwrap();

        assert_eq!(scenario.endpoints[0].namespace, "default");
        assert_eq!(scenario.rules[0].rule.ports[0].port, 80);
        assert_eq!(scenario.rules[0].rule.rules.as_ref().unwrap().http.len(), 1);
        let peers = scenario.rules[0].peer_selectors();
        assert!(!peers[0].is_wildcard());
        assert!(peers[1].is_wildcard());
        assert_eq!(scenario.dns_queries[0].port, 53);
        assert_eq!(scenario.dns_queries[0].protocol, Protocol::Udp);
        assert_eq!(scenario.selections[0].added, vec![NumericIdentity::new(2001)]);
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let err = Scenario::from_json(
            r#"{"endpoints": [{"id": 1, "name": "a"}, {"id": 1, "name": "b"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicydError::DuplicateEndpoint(1)));
    }
}
