//! Error types for policy construction and map-state synchronization.

use policy_types::{EndpointId, PortRange, Protocol};
use thiserror::Error;

use crate::l7_parser::L7ParserType;

/// Errors raised while turning rules into filters.
///
/// All of these reject the enclosing rule as a whole. Nothing is applied
/// partially and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("cannot merge conflicting L7 parsers ({a}/{b})")]
    ParserConflict { a: L7ParserType, b: L7ParserType },

    #[error("TLS secret {0} could not be resolved")]
    MissingTlsSecret(String),

    #[error("multiple L7 protocols in a single rule set: {0}")]
    MixedL7Rules(String),

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("L7 rules are not supported on {protocol} port {range}")]
    L7NotSupported { protocol: Protocol, range: PortRange },

    #[error("conflicting authentication requirements for selector {0}")]
    AuthConflict(String),

    #[error("conflicting TLS contexts for selector {0}")]
    TlsConflict(String),

    #[error("conflicting listeners for selector {0}")]
    ListenerConflict(String),

    #[error("invalid proxy ID: {0}")]
    InvalidProxyId(String),
}

/// Errors raised by the map-state synchronizer.
///
/// These indicate a broken consumption protocol, not a transient
/// condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("endpoint {0} is not registered with the policy")]
    NotRegistered(EndpointId),

    #[error("endpoint {0} already holds unreleased map changes")]
    ConsumptionContention(EndpointId),
}

/// Result type alias for policy construction.
pub type Result<T> = std::result::Result<T, PolicyError>;
