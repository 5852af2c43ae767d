//! Outcome of a scenario run.

use ces_manager::{CesId, EndpointSlice};
use policy_engine::{EntryValue, Key, PolicyModel, SyncSummary};
use policy_types::{EndpointId, Protocol};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub endpoints: Vec<EndpointReport>,
    pub rejected_rules: Vec<RejectedRule>,
    pub dns_errors: Vec<DnsError>,
    pub dns_queries: Vec<DnsQueryReport>,
    pub slices: Vec<EndpointSlice>,
    pub sync: SyncSummary,
    pub policy: PolicyModel,
}

impl Report {
    /// Returns true if every endpoint's incremental map state matches a
    /// full rebuild.
    pub fn converged(&self) -> bool {
        self.endpoints.iter().all(|e| e.converged)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointReport {
    pub id: EndpointId,
    pub name: String,
    pub namespace: String,
    pub ces: Option<CesId>,
    pub converged: bool,
    pub entries: Vec<MapEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapEntry {
    #[serde(flatten)]
    pub key: Key,
    #[serde(flatten)]
    pub value: EntryValue,
}

/// A port rule the policy refused.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRule {
    pub index: usize,
    pub error: String,
}

/// A DNS scope left in deny-all state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsError {
    pub endpoint: EndpointId,
    pub scope: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsQueryReport {
    pub endpoint: EndpointId,
    pub port: u16,
    pub protocol: Protocol,
    pub name: String,
    pub allowed: bool,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ep in &self.endpoints {
            let ces = ep.ces.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "endpoint {} ({}/{}) slice {} converged={}",
                ep.id, ep.namespace, ep.name, ces, ep.converged
            )?;
            for e in &ep.entries {
                write!(f, "  {}", e.key)?;
                if e.value.is_redirect() {
                    write!(f, " proxy-port={}", e.value.proxy_port)?;
                }
                writeln!(f, " auth={}", e.value.auth_type)?;
            }
        }
        for r in &self.rejected_rules {
            writeln!(f, "rejected rule #{}: {}", r.index, r.error)?;
        }
        for e in &self.dns_errors {
            writeln!(f, "dns scope {} of endpoint {} denies all: {}", e.scope, e.endpoint, e.error)?;
        }
        for q in &self.dns_queries {
            let verdict = if q.allowed { "allow" } else { "deny" };
            writeln!(
                f,
                "dns {} from endpoint {} on {}/{}: {}",
                q.name, q.endpoint, q.port, q.protocol, verdict
            )?;
        }
        writeln!(
            f,
            "slices={} published={} discarded={}",
            self.slices.len(),
            self.sync.published,
            self.sync.discarded
        )
    }
}
