//! Runs a scenario through the policy engine.
//!
//! The policy stream and the selector stream run as blocking tasks while
//! one consumer task per endpoint drains map changes at its own pace.
//! Once both streams finish, every endpoint is drained a last time and
//! its map state is checked against a full rebuild.

use crate::error::Result;
use crate::report::{DnsError, DnsQueryReport, EndpointReport, MapEntry, RejectedRule, Report};
use crate::scenario::{selector, Scenario};
use ces_manager::{CepKey, CesManager, CesManagerConfig, CoreEndpoint};
use dnsproxy::DnsRules;
use policy_engine::{EndpointPolicy, L4Policy, SelectorCache, SyncError, SyncSummary};
use policy_types::{PortProto, TrafficDirection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONSUMER_IDLE: Duration = Duration::from_millis(1);

/// Driver settings.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub ces: CesManagerConfig,
}

impl DriverConfig {
    pub fn with_ces(mut self, ces: CesManagerConfig) -> Self {
        self.ces = ces;
        self
    }
}

/// Runs `scenario` and reports the resulting state.
pub async fn run(scenario: Scenario, config: DriverConfig) -> Result<Report> {
    let scenario = Arc::new(scenario);
    let cache = Arc::new(SelectorCache::new());
    let policy = L4Policy::new(Arc::clone(&cache));
    let mut ces = CesManager::new(config.ces)?;

    let mut endpoints = Vec::with_capacity(scenario.endpoints.len());
    for spec in &scenario.endpoints {
        let endpoint = policy.register(Arc::new(spec.owner()));
        let slice = ces.update_cep_mapping(&CoreEndpoint::new(spec.name.as_str(), spec.identity), &spec.namespace);
        debug!(endpoint = spec.id, ces = %slice, "Endpoint placed");
        endpoints.push(endpoint);
    }

    let done = Arc::new(AtomicBool::new(false));
    let consumers: Vec<_> = endpoints
        .iter()
        .map(|ep| tokio::spawn(consume_until_done(Arc::clone(ep), Arc::clone(&done))))
        .collect();

    let policy_stream = {
        let policy = Arc::clone(&policy);
        let scenario = Arc::clone(&scenario);
        tokio::task::spawn_blocking(move || apply_rules(&policy, &scenario))
    };
    let selector_stream = {
        let policy = Arc::clone(&policy);
        let scenario = Arc::clone(&scenario);
        tokio::task::spawn_blocking(move || apply_selections(&policy, &scenario))
    };

    let rejected_rules = policy_stream.await?;
    let sync = selector_stream.await?;
    done.store(true, Ordering::Release);
    for consumer in consumers {
        consumer.await?;
    }

    let snapshot = cache.snapshot();
    let mut reports = Vec::with_capacity(endpoints.len());
    for (spec, endpoint) in scenario.endpoints.iter().zip(&endpoints) {
        drain(endpoint);
        let entries = endpoint.map_state().to_entries();
        let expected = policy.compute_map_state(endpoint.owner(), &snapshot).to_entries();
        let converged = entries == expected;
        if !converged {
            warn!(endpoint = spec.id, "Incremental map state differs from full rebuild");
        }
        reports.push(EndpointReport {
            id: spec.id,
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            ces: ces.ces_of(&CepKey::new(spec.namespace.as_str(), spec.name.as_str())),
            converged,
            entries: entries
                .into_iter()
                .map(|(key, value)| MapEntry { key, value })
                .collect(),
        });
    }

    let dns = DnsRules::new();
    let mut dns_errors = Vec::new();
    let egress: Vec<_> = policy
        .filters()
        .into_iter()
        .filter(|f| f.direction() == TrafficDirection::Egress)
        .collect();
    for endpoint in &endpoints {
        let failed = dns.update_from_filters(endpoint.id(), egress.iter().map(|f| f.as_ref()));
        for (scope, e) in failed {
            dns_errors.push(DnsError {
                endpoint: endpoint.id(),
                scope: scope.to_string(),
                error: e.to_string(),
            });
        }
    }
    let dns_queries = scenario
        .dns_queries
        .iter()
        .map(|q| DnsQueryReport {
            endpoint: q.endpoint,
            port: q.port,
            protocol: q.protocol,
            name: q.name.clone(),
            allowed: dns.check_allowed(q.endpoint, PortProto::new(q.port, q.protocol), &q.name, |s| {
                snapshot.selects(s, q.server)
            }),
        })
        .collect();

    for endpoint in &endpoints {
        endpoint.detach();
    }

    let report = Report {
        endpoints: reports,
        rejected_rules,
        dns_errors,
        dns_queries,
        slices: ces.slices().cloned().collect(),
        sync,
        policy: policy.model(),
    };
    info!(
        endpoints = report.endpoints.len(),
        converged = report.converged(),
        "Scenario complete"
    );
    Ok(report)
}

fn apply_rules(policy: &L4Policy, scenario: &Scenario) -> Vec<RejectedRule> {
    let secrets = scenario.secret_store();
    let mut rejected = Vec::new();
    for (index, spec) in scenario.rules.iter().enumerate() {
        let peers = spec.peer_selectors();
        if let Err(e) = policy.add_port_rule(
            &secrets,
            &peers,
            spec.authentication.as_ref(),
            &spec.rule,
            spec.direction,
        ) {
            rejected.push(RejectedRule {
                index,
                error: e.to_string(),
            });
        }
    }
    rejected
}

fn apply_selections(policy: &L4Policy, scenario: &Scenario) -> SyncSummary {
    let mut summary = SyncSummary::default();
    for spec in &scenario.selections {
        let update = policy
            .selector_cache()
            .update(&selector(&spec.selector), &spec.added, &spec.deleted);
        summary.add(policy.on_selections_changed(&update));
    }
    summary
}

async fn consume_until_done(endpoint: Arc<EndpointPolicy>, done: Arc<AtomicBool>) {
    while !done.load(Ordering::Acquire) {
        if !drain(&endpoint) {
            tokio::time::sleep(CONSUMER_IDLE).await;
        }
    }
}

/// Applies and releases whatever is visible. Returns false if no delta
/// was consumed.
fn drain(endpoint: &EndpointPolicy) -> bool {
    if !endpoint.map_changes().has_changes() {
        return false;
    }
    match endpoint.consume_map_changes() {
        Ok(handle) => {
            let consumed = handle.version().is_some();
            handle.release();
            consumed
        }
        Err(SyncError::ConsumptionContention(id)) => {
            warn!(endpoint = id, "Map changes already being consumed");
            false
        }
        Err(e) => {
            warn!(endpoint = endpoint.id(), error = %e, "Cannot consume map changes");
            false
        }
    }
}
