//! Security identities and traffic direction.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a local endpoint.
pub type EndpointId = u64;

/// Numeric security identity of a peer.
///
/// An identity stands for a set of security-relevant labels. Identity `0`
/// is reserved: in a map-state key it means "any peer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NumericIdentity(u32);

impl NumericIdentity {
    /// Wildcard identity matching every peer.
    pub const ANY: NumericIdentity = NumericIdentity(0);

    /// Creates an identity from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identity value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true for the wildcard identity.
    pub const fn is_any(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for NumericIdentity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NumericIdentity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| ParseError::InvalidIdentity(s.to_string()))
    }
}

/// Direction of traffic relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    /// Traffic entering the endpoint.
    #[default]
    Ingress,
    /// Traffic leaving the endpoint.
    Egress,
}

impl TrafficDirection {
    /// Maps the `ingress` flag used by filters onto a direction.
    pub const fn from_ingress(ingress: bool) -> Self {
        if ingress {
            TrafficDirection::Ingress
        } else {
            TrafficDirection::Egress
        }
    }

    /// Returns true for ingress.
    pub const fn is_ingress(&self) -> bool {
        matches!(self, TrafficDirection::Ingress)
    }
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficDirection::Ingress => write!(f, "ingress"),
            TrafficDirection::Egress => write!(f, "egress"),
        }
    }
}

impl FromStr for TrafficDirection {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingress" => Ok(TrafficDirection::Ingress),
            "egress" => Ok(TrafficDirection::Egress),
            _ => Err(ParseError::InvalidDirection(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identity_any() {
        assert!(NumericIdentity::ANY.is_any());
        assert!(!NumericIdentity::new(101).is_any());
        assert_eq!(NumericIdentity::default(), NumericIdentity::ANY);
    }

    #[test]
    fn test_identity_parse() {
        assert_eq!("101".parse::<NumericIdentity>().unwrap(), NumericIdentity::new(101));
        assert!("abc".parse::<NumericIdentity>().is_err());
    }

    #[test]
    fn test_direction() {
        assert_eq!(TrafficDirection::from_ingress(true), TrafficDirection::Ingress);
        assert_eq!(TrafficDirection::from_ingress(false), TrafficDirection::Egress);
        assert_eq!("EGRESS".parse::<TrafficDirection>().unwrap(), TrafficDirection::Egress);
        assert_eq!(TrafficDirection::Ingress.to_string(), "ingress");
    }
}
