//! Rule model consumed by filter construction.
//!
//! These types mirror the policy documents handed to the control plane.
//! Only the parts that influence L4 filters and their L7 payloads are
//! modeled here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use policy_types::Protocol;

use crate::error::{PolicyError, Result};
use crate::l7_parser::L7ParserType;

/// HTTP request match.
///
/// Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRuleHttp {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
}

/// Kafka request match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRuleKafka {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, rename = "apiKey", skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, rename = "clientID", skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
}

/// DNS name match: an exact name or a `*` glob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRuleDns {
    #[serde(default, rename = "matchName", skip_serializing_if = "String::is_empty")]
    pub match_name: String,
    #[serde(default, rename = "matchPattern", skip_serializing_if = "String::is_empty")]
    pub match_pattern: String,
}

impl PortRuleDns {
    /// Matches exactly one name.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            match_name: name.into(),
            ..Default::default()
        }
    }

    /// Matches a glob pattern.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            match_pattern: pattern.into(),
            ..Default::default()
        }
    }
}

/// Generic key/value rule for proxylib parsers.
pub type PortRuleL7 = BTreeMap<String, String>;

/// L7 rules attached to a port.
///
/// At most one of the rule kinds may be populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L7Rules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<PortRuleHttp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kafka: Vec<PortRuleKafka>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<PortRuleDns>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub l7proto: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub l7: Vec<PortRuleL7>,
}

impl L7Rules {
    /// Returns true if no rule of any kind is present.
    pub fn is_empty(&self) -> bool {
        self.http.is_empty()
            && self.kafka.is_empty()
            && self.dns.is_empty()
            && self.l7proto.is_empty()
            && self.l7.is_empty()
    }

    /// Returns the parser implied by the populated rule kind.
    pub fn parser_type(&self) -> Result<L7ParserType> {
        let mut kinds = Vec::new();
        if !self.http.is_empty() {
            kinds.push(L7ParserType::Http);
        }
        if !self.kafka.is_empty() {
            kinds.push(L7ParserType::Kafka);
        }
        if !self.dns.is_empty() {
            kinds.push(L7ParserType::Dns);
        }
        if !self.l7proto.is_empty() {
            kinds.push(L7ParserType::from_name(&self.l7proto));
        }
        match kinds.len() {
            0 => Ok(L7ParserType::None),
            1 => Ok(kinds.remove(0)),
            _ => Err(PolicyError::MixedL7Rules(
                kinds
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            )),
        }
    }

    /// Adds the rules of `other` that are not present yet.
    pub fn merge(&mut self, other: &L7Rules) {
        append_missing(&mut self.http, &other.http);
        append_missing(&mut self.kafka, &other.kafka);
        append_missing(&mut self.dns, &other.dns);
        if self.l7proto.is_empty() {
            self.l7proto = other.l7proto.clone();
        }
        append_missing(&mut self.l7, &other.l7);
    }

    /// Adds a rule that allows everything for `parser`.
    ///
    /// Used when a selector without L7 rules is merged into one that has
    /// them: the unrestricted side must remain unrestricted.
    pub fn add_wildcard(&mut self, parser: &L7ParserType) {
        match parser {
            L7ParserType::Http => append_missing(&mut self.http, &[PortRuleHttp::default()]),
            L7ParserType::Kafka => append_missing(&mut self.kafka, &[PortRuleKafka::default()]),
            L7ParserType::Dns => append_missing(&mut self.dns, &[PortRuleDns::pattern("*")]),
            L7ParserType::Custom(name) => {
                if self.l7proto.is_empty() {
                    self.l7proto = name.clone();
                }
                append_missing(&mut self.l7, &[PortRuleL7::new()]);
            }
            L7ParserType::None | L7ParserType::Tls | L7ParserType::Crd => {}
        }
    }
}

fn append_missing<T: Clone + PartialEq>(dst: &mut Vec<T>, src: &[T]) {
    for item in src {
        if !dst.contains(item) {
            dst.push(item.clone());
        }
    }
}

/// Reference to a TLS secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl Secret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// TLS context of a port rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsContext {
    pub secret: Secret,
}

/// Envoy listener reference of a port rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Listener {
    /// Name of the resource defining the listener.
    #[serde(rename = "envoyConfig")]
    pub envoy_config: String,
    /// Listener name within the resource.
    pub name: String,
}

impl Listener {
    /// Returns the fully qualified listener name.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.envoy_config, self.name)
    }
}

/// Mutual authentication mode requested by a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthenticationMode {
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "required")]
    Required,
    #[serde(rename = "test-always-fail")]
    TestAlwaysFail,
}

/// Authentication requirement of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authentication {
    pub mode: AuthenticationMode,
}

impl Authentication {
    pub fn new(mode: AuthenticationMode) -> Self {
        Self { mode }
    }
}

/// Port and protocol of a port rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProtocol {
    /// First port, `0` for all ports.
    #[serde(default)]
    pub port: u16,
    /// Last port of a range, `0` for a single port.
    #[serde(default, rename = "endPort")]
    pub end_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortProtocol {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self {
            port,
            end_port: 0,
            protocol,
        }
    }

    pub fn range(port: u16, end_port: u16, protocol: Protocol) -> Self {
        Self {
            port,
            end_port,
            protocol,
        }
    }
}

/// Ports a rule applies to, together with their L7 treatment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    #[serde(default)]
    pub ports: Vec<PortProtocol>,
    #[serde(default, rename = "terminatingTLS", skip_serializing_if = "Option::is_none")]
    pub terminating_tls: Option<TlsContext>,
    #[serde(default, rename = "originatingTLS", skip_serializing_if = "Option::is_none")]
    pub originating_tls: Option<TlsContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<Listener>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<L7Rules>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parser_type_from_rules() {
        let mut rules = L7Rules::default();
        assert_eq!(rules.parser_type(), Ok(L7ParserType::None));

        rules.dns.push(PortRuleDns::name("example.com"));
        assert_eq!(rules.parser_type(), Ok(L7ParserType::Dns));

        rules.http.push(PortRuleHttp::default());
        assert_eq!(
            rules.parser_type(),
            Err(PolicyError::MixedL7Rules("http,dns".to_string()))
        );

        let custom = L7Rules {
            l7proto: "tester".to_string(),
            ..Default::default()
        };
        assert_eq!(
            custom.parser_type(),
            Ok(L7ParserType::Custom("tester".to_string()))
        );
    }

    #[test]
    fn test_merge_dedups() {
        let get = PortRuleHttp {
            path: "/".to_string(),
            method: "GET".to_string(),
            ..Default::default()
        };
        let mut a = L7Rules {
            http: vec![get.clone()],
            ..Default::default()
        };
        let b = L7Rules {
            http: vec![
                get.clone(),
                PortRuleHttp {
                    path: "/bar".to_string(),
                    ..get.clone()
                },
            ],
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.http.len(), 2);

        a.add_wildcard(&L7ParserType::Http);
        a.add_wildcard(&L7ParserType::Http);
        assert_eq!(a.http.len(), 3);
        assert_eq!(a.http[2], PortRuleHttp::default());
    }

    #[test]
    fn test_http_rule_json() {
        let rule = PortRuleHttp {
            path: "/".to_string(),
            method: "GET".to_string(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&rule).unwrap(),
            r#"{"path":"/","method":"GET"}"#
        );
    }

    #[test]
    fn test_port_rule_json() {
        let rule: PortRule = serde_json::from_str(
            r#"{
                "ports": [{"port": 53, "protocol": "UDP"}],
                "rules": {"dns": [{"matchPattern": "*.example.com"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(rule.ports, vec![PortProtocol::new(53, Protocol::Udp)]);
        assert_eq!(
            rule.rules.unwrap().dns,
            vec![PortRuleDns::pattern("*.example.com")]
        );
    }
}
