//! Common value types for the network policy control plane.
//!
//! This crate provides type-safe representations of the primitives shared
//! by the policy engine and the DNS proxy:
//!
//! - [`NumericIdentity`]: numeric security identity of a peer
//! - [`Protocol`]: L4 protocol selector (TCP, UDP, SCTP, ICMP, ANY)
//! - [`PortRange`]: inclusive L4 port range
//! - [`PortProto`]: packed (port, protocol) key used by the DNS proxy
//! - [`TrafficDirection`]: ingress or egress

mod identity;
mod port;

pub use identity::{EndpointId, NumericIdentity, TrafficDirection};
pub use port::{PortProto, PortRange, Protocol};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid traffic direction: {0}")]
    InvalidDirection(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}
