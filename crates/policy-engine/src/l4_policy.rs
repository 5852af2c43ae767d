//! Shared L4 policy and the registry of endpoints subscribed to it.
//!
//! Producers hold `propagation` for the whole of a change. The `users`
//! lock is only held to register, unregister or snapshot the subscriber
//! list, and syncing to endpoints happens without it. Registration reads
//! the direction tables under `users`; nothing takes `users` while
//! holding a direction table lock.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use policy_common::Version;
use policy_types::{EndpointId, NumericIdentity, Protocol, TrafficDirection};
use tracing::{debug, info, warn};

use crate::endpoint_policy::{EndpointPolicy, PolicyOwner};
use crate::error::Result;
use crate::l4_filter::{FilterKey, L4Filter};
use crate::l4_map::L4PolicyMap;
use crate::map_changes::{FilterDelta, SyncSummary};
use crate::map_state::{ChangeState, MapState};
use crate::per_selector::{RedirectTypes, SecretResolver};
use crate::rules::{Authentication, L7Rules, PortProtocol, PortRule};
use crate::selector::{CachedSelector, SelectionSnapshot, SelectionUpdate, SelectorCache};

/// Filters of one direction.
#[derive(Debug, Clone, Default)]
pub struct L4DirectionPolicy {
    pub port_rules: L4PolicyMap,
}

impl L4DirectionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn redirect_type(&self) -> RedirectTypes {
        self.port_rules
            .iter()
            .fold(RedirectTypes::NONE, |acc, f| acc | f.redirect_type())
    }

    fn model(&self) -> Vec<PolicyRuleModel> {
        self.port_rules
            .iter()
            .filter_map(|filter| match filter_model(filter) {
                Ok(rule) => Some(PolicyRuleModel { rule }),
                Err(e) => {
                    warn!(filter = %filter.key(), error = %e, "Failed to render filter model");
                    None
                }
            })
            .collect()
    }
}

/// Rendered filter, as exposed by the policy API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyRuleModel {
    pub rule: String,
}

/// Rendered policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyModel {
    pub ingress: Vec<PolicyRuleModel>,
    pub egress: Vec<PolicyRuleModel>,
}

#[derive(Serialize)]
struct FilterModel<'a> {
    port: u16,
    #[serde(rename = "end-port", skip_serializing_if = "is_zero")]
    end_port: u16,
    protocol: Protocol,
    #[serde(rename = "l7-rules", skip_serializing_if = "Vec::is_empty")]
    l7_rules: Vec<BTreeMap<&'a str, &'a L7Rules>>,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

fn filter_model(filter: &L4Filter) -> serde_json::Result<String> {
    let (start, end) = (filter.ports.start(), filter.ports.end());
    let model = FilterModel {
        port: start,
        end_port: if end != start { end } else { 0 },
        protocol: filter.protocol,
        l7_rules: filter
            .per_selector_policies
            .iter()
            .filter_map(|(selector, policy)| {
                policy
                    .as_ref()
                    .map(|p| BTreeMap::from([(selector.key(), &p.l7_rules)]))
            })
            .collect(),
    };
    serde_json::to_string(&model)
}

/// L4 policy shared by every endpoint whose identity selects the same
/// rules.
///
/// Filter changes and selector updates are pushed to the subscribed
/// endpoints as deltas. Each endpoint applies them to its own map state
/// when it consumes its changes.
pub struct L4Policy {
    selector_cache: Arc<SelectorCache>,
    ingress: RwLock<L4DirectionPolicy>,
    egress: RwLock<L4DirectionPolicy>,
    users: Mutex<BTreeMap<EndpointId, Weak<EndpointPolicy>>>,
    /// Serializes producers so that deltas reach each endpoint in
    /// version order.
    propagation: Mutex<()>,
}

impl L4Policy {
    pub fn new(selector_cache: Arc<SelectorCache>) -> Arc<Self> {
        Arc::new(Self {
            selector_cache,
            ingress: RwLock::new(L4DirectionPolicy::new()),
            egress: RwLock::new(L4DirectionPolicy::new()),
            users: Mutex::new(BTreeMap::new()),
            propagation: Mutex::new(()),
        })
    }

    pub fn selector_cache(&self) -> &Arc<SelectorCache> {
        &self.selector_cache
    }

    fn direction(&self, direction: TrafficDirection) -> &RwLock<L4DirectionPolicy> {
        match direction {
            TrafficDirection::Ingress => &self.ingress,
            TrafficDirection::Egress => &self.egress,
        }
    }

    fn read(&self, direction: TrafficDirection) -> RwLockReadGuard<'_, L4DirectionPolicy> {
        self.direction(direction)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, direction: TrafficDirection) -> RwLockWriteGuard<'_, L4DirectionPolicy> {
        self.direction(direction)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_users(&self) -> MutexGuard<'_, BTreeMap<EndpointId, Weak<EndpointPolicy>>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_propagation(&self) -> MutexGuard<'_, ()> {
        self.propagation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the filter at exactly `key`.
    pub fn filter(&self, key: &FilterKey) -> Option<Arc<L4Filter>> {
        self.read(key.direction)
            .port_rules
            .exact_lookup(key.ports.start(), key.ports.end(), key.protocol)
            .cloned()
    }

    /// Returns every filter, ingress first.
    pub fn filters(&self) -> Vec<Arc<L4Filter>> {
        let mut filters: Vec<_> = self.read(TrafficDirection::Ingress).port_rules.iter().cloned().collect();
        filters.extend(self.read(TrafficDirection::Egress).port_rules.iter().cloned());
        filters
    }

    /// Translates a port rule into filters and merges them into the
    /// policy.
    ///
    /// A rule without ports applies to all ports and protocols. The rule is
    /// applied as a whole or not at all.
    pub fn add_port_rule(
        &self,
        resolver: &dyn SecretResolver,
        peers: &[CachedSelector],
        auth: Option<&Authentication>,
        rule: &PortRule,
        direction: TrafficDirection,
    ) -> Result<Vec<FilterKey>> {
        let ingress = direction.is_ingress();
        let wildcard_port = [PortProtocol::default()];
        let ports = if rule.ports.is_empty() {
            &wildcard_port[..]
        } else {
            &rule.ports[..]
        };

        let _guard = self.lock_propagation();
        let mut staged: BTreeMap<FilterKey, L4Filter> = BTreeMap::new();
        {
            let table = self.read(direction);
            for port in ports {
                let filter = L4Filter::create(resolver, peers, auth, rule, port, ingress)
                    .inspect_err(|e| warn!(port = port.port, protocol = %port.protocol, error = %e, "Rejecting port rule"))?;
                let key = filter.key();
                let existing = staged.remove(&key).or_else(|| {
                    table
                        .port_rules
                        .exact_lookup(key.ports.start(), key.ports.end(), key.protocol)
                        .map(|f| (**f).clone())
                });
                let merged = match existing {
                    Some(mut existing) => {
                        existing
                            .merge(&filter)
                            .inspect_err(|e| warn!(filter = %key, error = %e, "Rejecting conflicting port rule"))?;
                        existing
                    }
                    None => filter,
                };
                staged.insert(key, merged);
            }
        }

        let keys: Vec<FilterKey> = staged.keys().copied().collect();
        let filters: Vec<Arc<L4Filter>> = {
            let mut table = self.write(direction);
            staged
                .into_values()
                .map(|filter| {
                    let filter = Arc::new(filter);
                    table.port_rules.upsert_filter(Arc::clone(&filter));
                    filter
                })
                .collect()
        };
        for filter in &filters {
            self.propagate_reset(filter);
        }
        Ok(keys)
    }

    /// Inserts or replaces a filter and pushes it to every endpoint.
    pub fn upsert_filter(&self, filter: L4Filter) -> Arc<L4Filter> {
        let _guard = self.lock_propagation();
        let filter = Arc::new(filter);
        self.write(filter.direction())
            .port_rules
            .upsert_filter(Arc::clone(&filter));
        self.propagate_reset(&filter);
        filter
    }

    /// Removes a filter and its entries from every endpoint.
    pub fn remove_filter(&self, key: &FilterKey) -> Option<Arc<L4Filter>> {
        let _guard = self.lock_propagation();
        let removed = self
            .write(key.direction)
            .port_rules
            .delete(key.ports.start(), key.ports.end(), key.protocol)?;

        let version = self.selector_cache.version();
        let users = self.live_users();
        for user in &users {
            let mut delta = FilterDelta::new();
            delta.mark_reset();
            user.changes.accumulate(*key, delta);
        }
        for user in &users {
            user.changes.sync(key, version);
        }
        debug!(filter = %key, endpoints = users.len(), "Removed filter");
        Some(removed)
    }

    /// Replaces every entry of `filter` on every endpoint with entries
    /// computed from the current selections.
    fn propagate_reset(&self, filter: &L4Filter) {
        let key = filter.key();
        let users = self.live_users();
        let snapshot = self.selector_cache.snapshot();
        for user in &users {
            user.changes
                .accumulate(key, filter.reset_delta(user.owner(), &snapshot));
        }
        for user in &users {
            user.changes.sync(&key, snapshot.version());
        }
        debug!(filter = %key, version = %snapshot.version(), endpoints = users.len(), "Propagated filter");
    }

    /// Buffers, for every endpoint, the entries gained and lost because
    /// `added` and `deleted` started or stopped matching `selector`.
    ///
    /// Callers must not run this concurrently with another producer for
    /// the same filter; [`L4Policy::on_selections_changed`] takes care of
    /// that.
    pub fn accumulate_map_changes(
        &self,
        filter: &L4Filter,
        selector: &CachedSelector,
        added: &[NumericIdentity],
        deleted: &[NumericIdentity],
    ) {
        if !filter.has_selector(selector) {
            debug!(filter = %filter.key(), selector = %selector, "Selector not part of filter");
            return;
        }
        for user in self.live_users() {
            if let Some(delta) = filter.selection_delta(user.owner(), selector, added, deleted) {
                user.changes.accumulate(filter.key(), delta);
            }
        }
    }

    /// Makes the accumulated changes of `filter` visible to every
    /// endpoint, tagged with `version`.
    ///
    /// Blocks on endpoints whose consumer has not released its previous
    /// changes.
    pub fn sync_map_changes(&self, filter: &L4Filter, version: Version) -> SyncSummary {
        let key = filter.key();
        let mut summary = SyncSummary::default();
        for user in self.live_users() {
            summary.record(user.changes.sync(&key, version));
        }
        summary
    }

    /// Pushes a selector update to every endpoint.
    pub fn on_selections_changed(&self, update: &SelectionUpdate) -> SyncSummary {
        let mut summary = SyncSummary::default();
        if update.is_empty() {
            return summary;
        }
        let _guard = self.lock_propagation();
        for filter in self.filters() {
            if !filter.has_selector(&update.selector) {
                continue;
            }
            self.accumulate_map_changes(&filter, &update.selector, &update.added, &update.deleted);
            summary.add(self.sync_map_changes(&filter, update.version));
        }
        summary
    }

    /// Computes the full map state of `owner` from `snapshot`.
    pub fn compute_map_state(&self, owner: &dyn PolicyOwner, snapshot: &SelectionSnapshot) -> MapState {
        let mut map_state = MapState::new();
        let mut changes = ChangeState::default();
        for filter in self.filters() {
            filter.to_map_state(owner, snapshot, &mut map_state, &mut changes);
        }
        map_state
    }

    /// Subscribes an endpoint to this policy.
    ///
    /// The endpoint starts from a full map state computed against the
    /// current snapshot. Registration waits for in-progress producers, so
    /// every delta the endpoint receives is built from a snapshot at least
    /// as new as its own.
    pub fn register(self: &Arc<Self>, owner: Arc<dyn PolicyOwner>) -> Arc<EndpointPolicy> {
        let id = owner.endpoint_id();
        let _guard = self.lock_propagation();
        let mut users = self.lock_users();
        let snapshot = self.selector_cache.snapshot();
        let map_state = self.compute_map_state(owner.as_ref(), &snapshot);
        let entries = map_state.len();

        let endpoint = Arc::new(EndpointPolicy::new(
            Arc::clone(self),
            owner,
            map_state,
            snapshot.version(),
        ));
        users.insert(id, Arc::downgrade(&endpoint));
        info!(
            endpoint = id,
            version = %snapshot.version(),
            entries,
            "Endpoint registered with policy"
        );
        endpoint
    }

    /// Drops `endpoint` from the subscriber list.
    pub(crate) fn remove_user(&self, endpoint: &EndpointPolicy) {
        let mut users = self.lock_users();
        let is_same = users
            .get(&endpoint.id())
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), endpoint));
        if is_same {
            users.remove(&endpoint.id());
        }
    }

    fn live_users(&self) -> Vec<Arc<EndpointPolicy>> {
        self.lock_users()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Returns the number of subscribed endpoints.
    pub fn user_count(&self) -> usize {
        self.live_users().len()
    }

    /// Returns true if any filter redirects to Envoy.
    pub fn has_envoy_redirect(&self) -> bool {
        self.redirect_type().contains(RedirectTypes::ENVOY)
    }

    /// Returns true if any filter redirects to a proxylib parser.
    pub fn has_proxylib_redirect(&self) -> bool {
        self.redirect_type().contains(RedirectTypes::PROXYLIB)
    }

    fn redirect_type(&self) -> RedirectTypes {
        self.read(TrafficDirection::Ingress).redirect_type()
            | self.read(TrafficDirection::Egress).redirect_type()
    }

    /// Renders every filter as JSON, per direction.
    pub fn model(&self) -> PolicyModel {
        PolicyModel {
            ingress: self.read(TrafficDirection::Ingress).model(),
            egress: self.read(TrafficDirection::Egress).model(),
        }
    }
}

impl std::fmt::Debug for L4Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L4Policy")
            .field("ingress", &self.read(TrafficDirection::Ingress).port_rules.len())
            .field("egress", &self.read(TrafficDirection::Egress).port_rules.len())
            .finish()
    }
}
