//! Endpoint-side view of a shared policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use policy_common::Version;
use policy_types::{EndpointId, Protocol};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::l4_policy::L4Policy;
use crate::map_changes::MapChanges;
use crate::map_state::{ChangeState, MapState};
use crate::proxy_id::proxy_id;

/// The endpoint a policy is computed for.
pub trait PolicyOwner: Send + Sync {
    fn endpoint_id(&self) -> EndpointId;

    /// Returns the proxy port allocated for a redirect, if any.
    fn lookup_redirect_port(
        &self,
        ingress: bool,
        protocol: Protocol,
        port: u16,
        listener: &str,
    ) -> Option<u16>;
}

/// Policy owner with a fixed table of redirect ports, keyed by proxy ID.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyOwner {
    id: EndpointId,
    redirects: HashMap<String, u16>,
}

impl StaticPolicyOwner {
    pub fn new(id: EndpointId) -> Self {
        Self {
            id,
            redirects: HashMap::new(),
        }
    }

    /// Allocates `proxy_port` for the redirect.
    pub fn set_redirect(
        &mut self,
        ingress: bool,
        protocol: Protocol,
        port: u16,
        listener: &str,
        proxy_port: u16,
    ) {
        self.redirects
            .insert(proxy_id(self.id, ingress, protocol, port, listener), proxy_port);
    }
}

impl PolicyOwner for StaticPolicyOwner {
    fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn lookup_redirect_port(
        &self,
        ingress: bool,
        protocol: Protocol,
        port: u16,
        listener: &str,
    ) -> Option<u16> {
        self.redirects
            .get(&proxy_id(self.id, ingress, protocol, port, listener))
            .copied()
    }
}

/// Live enforcement state of one endpoint subscribed to an [`L4Policy`].
///
/// The map state is only mutated through [`EndpointPolicy::consume_map_changes`].
pub struct EndpointPolicy {
    id: EndpointId,
    policy: Arc<L4Policy>,
    owner: Arc<dyn PolicyOwner>,
    map_state: Mutex<MapState>,
    pub(crate) changes: MapChanges,
    registered: AtomicBool,
}

impl EndpointPolicy {
    pub(crate) fn new(
        policy: Arc<L4Policy>,
        owner: Arc<dyn PolicyOwner>,
        map_state: MapState,
        base_version: Version,
    ) -> Self {
        let id = owner.endpoint_id();
        Self {
            id,
            policy,
            owner,
            map_state: Mutex::new(map_state),
            changes: MapChanges::new(id, base_version),
            registered: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn policy(&self) -> &Arc<L4Policy> {
        &self.policy
    }

    pub fn owner(&self) -> &dyn PolicyOwner {
        self.owner.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Returns the buffered changes of this endpoint.
    pub fn map_changes(&self) -> &MapChanges {
        &self.changes
    }

    fn lock_map_state(&self) -> MutexGuard<'_, MapState> {
        self.map_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the current map state.
    pub fn map_state(&self) -> MapState {
        self.lock_map_state().clone()
    }

    /// Applies every visible delta to the map state.
    ///
    /// The returned handle must be released (or dropped) before producers
    /// can publish further deltas for this endpoint.
    pub fn consume_map_changes(&self) -> Result<MapChangesHandle<'_>, SyncError> {
        if !self.is_registered() {
            return Err(SyncError::NotRegistered(self.id));
        }
        let deltas = self.changes.acquire()?;
        let mut map_state = self.lock_map_state();

        let mut changes = ChangeState::default();
        let mut version = None;
        for synced in deltas {
            map_state.apply_delta(&synced.filter, synced.delta, &mut changes);
            version = version.max(Some(synced.version));
        }

        if !changes.is_empty() {
            debug!(
                endpoint = self.id,
                adds = changes.adds.len(),
                deletes = changes.deletes.len(),
                "Applied map changes"
            );
        }

        Ok(MapChangesHandle {
            endpoint: self,
            map_state,
            changes,
            version,
        })
    }

    /// Unregisters from the policy and releases the map state.
    ///
    /// Producers blocked on this endpoint are woken up and their deltas
    /// dropped.
    ///
    /// This waits for any outstanding [`MapChangesHandle`], so calling it
    /// while the same thread holds one deadlocks. Use
    /// [`MapChangesHandle::detach`] there instead.
    pub fn detach(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        self.policy.remove_user(self);
        self.changes.close();
        *self.lock_map_state() = MapState::new();
        info!(endpoint = self.id, "Endpoint unregistered from policy");
    }
}

impl Drop for EndpointPolicy {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for EndpointPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPolicy")
            .field("id", &self.id)
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Consumed map changes of one endpoint.
///
/// Holds the endpoint's map state until it is released. Dropping the
/// handle releases it.
#[must_use = "dropping the handle releases the consumed changes"]
pub struct MapChangesHandle<'a> {
    endpoint: &'a EndpointPolicy,
    map_state: MutexGuard<'a, MapState>,
    changes: ChangeState,
    version: Option<Version>,
}

impl MapChangesHandle<'_> {
    /// Returns the keys touched by the consumed deltas.
    pub fn changes(&self) -> &ChangeState {
        &self.changes
    }

    /// Returns the map state after applying the consumed deltas.
    pub fn map_state(&self) -> &MapState {
        &self.map_state
    }

    /// Returns the newest version consumed, if any delta was visible.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Acknowledges the consumed changes.
    pub fn release(self) {
        drop(self);
    }

    /// Releases the handle, then unregisters the endpoint.
    pub fn detach(self) {
        let endpoint = self.endpoint;
        drop(self);
        endpoint.detach();
    }
}

impl std::fmt::Debug for MapChangesHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapChangesHandle")
            .field("endpoint", &self.endpoint)
            .field("changes", &self.changes)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for MapChangesHandle<'_> {
    fn drop(&mut self) {
        self.endpoint.changes.release();
    }
}
