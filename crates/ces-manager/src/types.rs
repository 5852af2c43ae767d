//! Endpoints and slices.

use policy_types::NumericIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Namespaced name of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CepKey {
    pub namespace: String,
    pub name: String,
}

impl CepKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The part of an endpoint carried in a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreEndpoint {
    pub name: String,
    pub identity: NumericIdentity,
}

impl CoreEndpoint {
    pub fn new(name: impl Into<String>, identity: NumericIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
        }
    }
}

/// Identifier of an endpoint slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CesId(u64);

impl CesId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ces-{:06}", self.0)
    }
}

/// Contents of one slice. All endpoints share its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSlice {
    pub id: CesId,
    pub namespace: String,
    pub endpoints: BTreeMap<String, NumericIdentity>,
}

impl EndpointSlice {
    pub(crate) fn new(id: CesId, namespace: impl Into<String>) -> Self {
        Self {
            id,
            namespace: namespace.into(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
