//! Proxy IDs identify a redirect of one endpoint, direction, protocol and
//! port to a proxy listener.
//!
//! Format: `<endpoint><ingress|egress>:<PROTOCOL>:<port>:<listener>`, for
//! example `42ingress:TCP:80:` or `7egress:TCP:443:cec/listener`.

use policy_types::{EndpointId, Protocol};

use crate::error::{PolicyError, Result};

/// Components of a proxy ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProxyId {
    pub endpoint: EndpointId,
    pub ingress: bool,
    pub protocol: Protocol,
    pub port: u16,
    pub listener: String,
}

/// Renders the proxy ID of a redirect.
pub fn proxy_id(endpoint: EndpointId, ingress: bool, protocol: Protocol, port: u16, listener: &str) -> String {
    let direction = if ingress { "ingress" } else { "egress" };
    format!("{endpoint}{direction}:{protocol}:{port}:{listener}")
}

/// Parses a proxy ID rendered by [`proxy_id`].
pub fn parse_proxy_id(id: &str) -> Result<ParsedProxyId> {
    let invalid = || PolicyError::InvalidProxyId(id.to_string());

    let mut parts = id.splitn(4, ':');
    let head = parts.next().ok_or_else(invalid)?;
    let protocol = parts.next().ok_or_else(invalid)?;
    let port = parts.next().ok_or_else(invalid)?;
    let listener = parts.next().ok_or_else(invalid)?;

    let (endpoint, ingress) = if let Some(ep) = head.strip_suffix("ingress") {
        (ep, true)
    } else if let Some(ep) = head.strip_suffix("egress") {
        (ep, false)
    } else {
        return Err(invalid());
    };

    Ok(ParsedProxyId {
        endpoint: endpoint.parse().map_err(|_| invalid())?,
        ingress,
        protocol: protocol.parse().map_err(|_| invalid())?,
        port: port.parse().map_err(|_| invalid())?,
        listener: listener.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_proxy_id_format() {
        assert_eq!(proxy_id(123, true, Protocol::Tcp, 8080, ""), "123ingress:TCP:8080:");
        assert_eq!(
            proxy_id(7, false, Protocol::Udp, 53, "cec/dns"),
            "7egress:UDP:53:cec/dns"
        );
    }

    #[test]
    fn test_parse_proxy_id() {
        let parsed = parse_proxy_id("123ingress:TCP:8080:").unwrap();
        assert_eq!(
            parsed,
            ParsedProxyId {
                endpoint: 123,
                ingress: true,
                protocol: Protocol::Tcp,
                port: 8080,
                listener: String::new(),
            }
        );

        let parsed = parse_proxy_id(&proxy_id(9, false, Protocol::Tcp, 443, "ns/cec:l1")).unwrap();
        assert!(!parsed.ingress);
        assert_eq!(parsed.listener, "ns/cec:l1");
    }

    #[test]
    fn test_parse_invalid() {
        for id in ["", "123:TCP:80:", "abcingress:TCP:80:", "1ingress:XYZ:80:", "1egress:TCP:80"] {
            assert_eq!(
                parse_proxy_id(id),
                Err(PolicyError::InvalidProxyId(id.to_string())),
                "{id}"
            );
        }
    }
}
