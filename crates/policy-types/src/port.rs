//! L4 protocol and port range definitions.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// L4 protocol a policy rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Any protocol (wildcard).
    #[default]
    Any,
    /// Transmission Control Protocol.
    Tcp,
    /// User Datagram Protocol.
    Udp,
    /// Stream Control Transmission Protocol.
    Sctp,
    /// ICMP for IPv4.
    Icmp,
    /// ICMP for IPv6.
    #[serde(rename = "ICMPV6")]
    IcmpV6,
}

impl Protocol {
    /// Returns the IANA protocol number (`0` for [`Protocol::Any`]).
    pub const fn number(&self) -> u8 {
        match self {
            Protocol::Any => 0,
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::IcmpV6 => 58,
            Protocol::Sctp => 132,
        }
    }

    /// Returns the protocol for an IANA protocol number, if known.
    pub const fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Protocol::Any),
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            58 => Some(Protocol::IcmpV6),
            132 => Some(Protocol::Sctp),
            _ => None,
        }
    }

    /// Returns true if L7 redirection is possible on this protocol.
    pub const fn supports_l7(&self) -> bool {
        matches!(self, Protocol::Any | Protocol::Tcp | Protocol::Udp | Protocol::Sctp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Any => "ANY",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
            Protocol::Icmp => "ICMP",
            Protocol::IcmpV6 => "ICMPV6",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ANY" | "" => Ok(Protocol::Any),
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            "ICMP" => Ok(Protocol::Icmp),
            "ICMPV6" => Ok(Protocol::IcmpV6),
            _ => Err(ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Inclusive range of L4 ports.
///
/// A single port is stored as `start == end`. The range `0-0` means "all
/// ports" and is what a port-less rule compiles to.
///
/// Every range goes through [`PortRange::new`] or one of the const
/// constructors, so `end` is never below `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "RangeBounds")]
pub struct PortRange {
    start: u16,
    end: u16,
}

/// Unvalidated bounds as they appear on the wire.
#[derive(Deserialize)]
struct RangeBounds {
    start: u16,
    #[serde(default)]
    end: u16,
}

impl TryFrom<RangeBounds> for PortRange {
    type Error = ParseError;

    fn try_from(bounds: RangeBounds) -> Result<Self, Self::Error> {
        PortRange::new(bounds.start, bounds.end)
    }
}

impl PortRange {
    /// Creates a range. An `end` of `0` denotes a single port.
    pub fn new(start: u16, end: u16) -> Result<Self, ParseError> {
        let end = if end == 0 { start } else { end };
        if end < start {
            return Err(ParseError::InvalidPortRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First port of the range.
    pub const fn start(&self) -> u16 {
        self.start
    }

    /// Last port of the range, inclusive.
    pub const fn end(&self) -> u16 {
        self.end
    }

    /// Creates a single-port range.
    pub const fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    /// Range matching every port.
    pub const fn all() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Returns true if this range matches every port.
    pub const fn is_wildcard(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Returns true if the range holds exactly one port.
    pub const fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Returns true if `port` falls within the range.
    pub const fn contains(&self, port: u16) -> bool {
        self.is_wildcard() || (port >= self.start && port <= self.end)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| ParseError::InvalidPort(v.to_string()))
        };
        match s.split_once('-') {
            Some((start, end)) => PortRange::new(parse(start)?, parse(end)?),
            None => Ok(PortRange::single(parse(s)?)),
        }
    }
}

/// Packed (port, protocol) pair.
///
/// The protocol number lives in the top byte and the port in the low
/// 16 bits, so the value is usable as a compact map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortProto(u32);

impl PortProto {
    /// Packs a port and a protocol.
    pub const fn new(port: u16, protocol: Protocol) -> Self {
        Self(((protocol.number() as u32) << 24) | port as u32)
    }

    /// Returns the port.
    pub const fn port(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Returns the protocol, if it is a known one.
    pub const fn protocol(&self) -> Option<Protocol> {
        Protocol::from_number((self.0 >> 24) as u8)
    }

    /// Returns the packed value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol() {
            Some(proto) => write!(f, "{}/{}", self.port(), proto),
            None => write!(f, "{}/{}", self.port(), self.0 >> 24),
        }
    }
}
