//! First-come-first-served slice allocation.

use crate::config::CesManagerConfig;
use crate::error::{CesError, Result};
use crate::types::{CepKey, CesId, CoreEndpoint, EndpointSlice};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Packs endpoints into slices of bounded size, one namespace per slice.
///
/// An endpoint stays in its slice until it is removed. New endpoints go
/// to the most recently vacated slice of their namespace that has room,
/// then to any slice of the namespace with room, then to a new slice.
/// Slices are deleted when their last endpoint leaves.
#[derive(Debug)]
pub struct CesManager {
    max_ceps_per_ces: usize,
    next_id: u64,
    cep_to_ces: HashMap<CepKey, CesId>,
    slices: BTreeMap<CesId, EndpointSlice>,
    /// Per namespace, slices that lost an endpoint; most recent last.
    vacated: HashMap<String, Vec<CesId>>,
}

impl CesManager {
    pub fn new(config: CesManagerConfig) -> Result<Self> {
        if config.max_ceps_per_ces == 0 {
            return Err(CesError::InvalidCapacity(config.max_ceps_per_ces));
        }
        Ok(Self {
            max_ceps_per_ces: config.max_ceps_per_ces,
            next_id: 0,
            cep_to_ces: HashMap::new(),
            slices: BTreeMap::new(),
            vacated: HashMap::new(),
        })
    }

    /// Returns the number of slices.
    pub fn ces_count(&self) -> usize {
        self.slices.len()
    }

    /// Returns the number of mapped endpoints.
    pub fn cep_count(&self) -> usize {
        self.cep_to_ces.len()
    }

    /// Returns the slice an endpoint is mapped to.
    pub fn ces_of(&self, key: &CepKey) -> Option<CesId> {
        self.cep_to_ces.get(key).copied()
    }

    pub fn slice(&self, id: CesId) -> Option<&EndpointSlice> {
        self.slices.get(&id)
    }

    /// Returns the slices in id order.
    pub fn slices(&self) -> impl Iterator<Item = &EndpointSlice> {
        self.slices.values()
    }

    /// Maps an endpoint to a slice and returns it.
    ///
    /// An endpoint already mapped keeps its slice; only its data is
    /// refreshed.
    pub fn update_cep_mapping(&mut self, cep: &CoreEndpoint, namespace: &str) -> CesId {
        let key = CepKey::new(namespace, cep.name.as_str());
        if let Some(&id) = self.cep_to_ces.get(&key) {
            if let Some(slice) = self.slices.get_mut(&id) {
                slice.endpoints.insert(cep.name.clone(), cep.identity);
            }
            return id;
        }

        let id = match self.find_slice_with_room(namespace) {
            Some(id) => id,
            None => self.create_slice(namespace),
        };
        if let Some(slice) = self.slices.get_mut(&id) {
            slice.endpoints.insert(cep.name.clone(), cep.identity);
        }
        self.cep_to_ces.insert(key, id);
        debug!(endpoint = %cep.name, namespace, ces = %id, "Mapped endpoint to slice");
        id
    }

    /// Removes an endpoint from its slice and returns the slice.
    pub fn remove_cep_mapping(&mut self, cep: &CoreEndpoint, namespace: &str) -> Result<CesId> {
        let key = CepKey::new(namespace, cep.name.as_str());
        let id = self
            .cep_to_ces
            .remove(&key)
            .ok_or_else(|| CesError::NotFound(key.to_string()))?;

        let now_empty = match self.slices.get_mut(&id) {
            Some(slice) => {
                slice.endpoints.remove(&cep.name);
                slice.is_empty()
            }
            None => true,
        };

        let vacated = self.vacated.entry(namespace.to_string()).or_default();
        vacated.retain(|v| *v != id);
        if now_empty {
            self.slices.remove(&id);
            if vacated.is_empty() {
                self.vacated.remove(namespace);
            }
            debug!(ces = %id, namespace, "Deleted empty slice");
        } else {
            vacated.push(id);
        }
        debug!(endpoint = %cep.name, namespace, ces = %id, "Removed endpoint from slice");
        Ok(id)
    }

    fn has_room(&self, id: CesId) -> bool {
        self.slices
            .get(&id)
            .is_some_and(|s| s.len() < self.max_ceps_per_ces)
    }

    fn find_slice_with_room(&self, namespace: &str) -> Option<CesId> {
        if let Some(vacated) = self.vacated.get(namespace) {
            if let Some(&id) = vacated.iter().rev().find(|&&id| self.has_room(id)) {
                return Some(id);
            }
        }
        self.slices
            .values()
            .find(|s| s.namespace == namespace && s.len() < self.max_ceps_per_ces)
            .map(|s| s.id)
    }

    fn create_slice(&mut self, namespace: &str) -> CesId {
        self.next_id += 1;
        let id = CesId::new(self.next_id);
        self.slices.insert(id, EndpointSlice::new(id, namespace));
        debug!(ces = %id, namespace, "Created slice");
        id
    }
}
