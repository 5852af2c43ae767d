//! L7 parser types and their merge lattice.
//!
//! Several rules can select the same port. Each of them may ask for a
//! different L7 parser, and the filter for that port can only run one.
//! [`L7ParserType::merge`] decides which parser survives:
//!
//! - `None` is the bottom element and promotes to anything
//! - `Tls` promotes to every concrete parser except `Dns`
//! - `Crd` only merges with `None` (or itself)
//! - any two distinct concrete parsers conflict

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{PolicyError, Result};
use crate::per_selector::RedirectTypes;

/// L7 parser selected for a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum L7ParserType {
    /// No L7 parsing; traffic is handled at L3/L4 only.
    #[default]
    None,
    /// TLS interception without further L7 inspection.
    Tls,
    /// DNS proxy.
    Dns,
    /// HTTP via Envoy.
    Http,
    /// Kafka via the proxylib.
    Kafka,
    /// Envoy listener configured by a custom resource.
    Crd,
    /// Any other proxylib parser, by name.
    Custom(String),
}

impl L7ParserType {
    /// Returns the parser for `name`, mapping well-known names onto their
    /// dedicated variants.
    pub fn from_name(name: &str) -> Self {
        match name {
            "" => L7ParserType::None,
            "tls" => L7ParserType::Tls,
            "dns" => L7ParserType::Dns,
            "http" => L7ParserType::Http,
            "kafka" => L7ParserType::Kafka,
            "crd" => L7ParserType::Crd,
            other => L7ParserType::Custom(other.to_string()),
        }
    }

    /// Returns the parser name.
    pub fn as_str(&self) -> &str {
        match self {
            L7ParserType::None => "",
            L7ParserType::Tls => "tls",
            L7ParserType::Dns => "dns",
            L7ParserType::Http => "http",
            L7ParserType::Kafka => "kafka",
            L7ParserType::Crd => "crd",
            L7ParserType::Custom(name) => name,
        }
    }

    /// Returns true if no parser is selected.
    pub fn is_none(&self) -> bool {
        matches!(self, L7ParserType::None)
    }

    /// Returns true if the parser is driven by per-request L7 rules.
    ///
    /// TLS and CRD parsers carry no rules of their own.
    pub fn has_rules(&self) -> bool {
        matches!(
            self,
            L7ParserType::Dns | L7ParserType::Http | L7ParserType::Kafka | L7ParserType::Custom(_)
        )
    }

    /// Returns the proxy kind traffic is redirected to for this parser.
    pub fn redirect_type(&self) -> RedirectTypes {
        match self {
            L7ParserType::None => RedirectTypes::NONE,
            L7ParserType::Dns => RedirectTypes::DNS,
            L7ParserType::Tls | L7ParserType::Http | L7ParserType::Crd => RedirectTypes::ENVOY,
            L7ParserType::Kafka | L7ParserType::Custom(_) => RedirectTypes::PROXYLIB,
        }
    }

    /// Merges two parser types, failing if they cannot share a port.
    ///
    /// The operation is commutative.
    pub fn merge(&self, other: &L7ParserType) -> Result<L7ParserType> {
        if self == other || self.is_none() {
            return Ok(other.clone());
        }
        if other.is_none() {
            return Ok(self.clone());
        }
        // CRD must be checked before TLS: a listener never absorbs TLS.
        if matches!(self, L7ParserType::Crd) || matches!(other, L7ParserType::Crd) {
            return Err(self.conflict(other));
        }
        match (self, other) {
            (L7ParserType::Tls, b) if *b != L7ParserType::Dns => Ok(b.clone()),
            (a, L7ParserType::Tls) if *a != L7ParserType::Dns => Ok(a.clone()),
            _ => Err(self.conflict(other)),
        }
    }

    fn conflict(&self, other: &L7ParserType) -> PolicyError {
        PolicyError::ParserConflict {
            a: self.clone(),
            b: other.clone(),
        }
    }
}

impl fmt::Display for L7ParserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for L7ParserType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl Serialize for L7ParserType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for L7ParserType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}
