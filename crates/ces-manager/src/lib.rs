//! Endpoint slice allocation.
//!
//! Endpoints are batched into slices so that watchers receive a few
//! large objects instead of one object per endpoint. [`CesManager`] packs
//! them first-come-first-served:
//!
//! - a slice holds endpoints of a single namespace, up to
//!   [`CesManagerConfig::max_ceps_per_ces`]
//! - a mapped endpoint never moves to another slice
//! - freed slots are refilled before new slices are created
//!
//! # Example
//!
//! ```
//! use ces_manager::{CesManager, CesManagerConfig, CoreEndpoint};
//! use policy_types::NumericIdentity;
//!
//! let mut manager = CesManager::new(CesManagerConfig::new().with_max_ceps_per_ces(2)).unwrap();
//! for name in ["a", "b", "c"] {
//!     manager.update_cep_mapping(&CoreEndpoint::new(name, NumericIdentity::new(1)), "default");
//! }
//! assert_eq!(manager.ces_count(), 2);
//! ```

mod config;
mod error;
mod manager;
mod types;

pub use config::{CesManagerConfig, DEFAULT_MAX_CEPS_PER_CES};
pub use error::{CesError, Result};
pub use manager::CesManager;
pub use types::{CepKey, CesId, CoreEndpoint, EndpointSlice};
