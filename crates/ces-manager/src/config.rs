use serde::{Deserialize, Serialize};

/// Default number of endpoints packed into one slice.
pub const DEFAULT_MAX_CEPS_PER_CES: usize = 100;

/// Endpoint slice manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CesManagerConfig {
    /// Maximum number of endpoints in one slice.
    pub max_ceps_per_ces: usize,
}

impl CesManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_ceps_per_ces(mut self, max: usize) -> Self {
        self.max_ceps_per_ces = max;
        self
    }
}

impl Default for CesManagerConfig {
    fn default() -> Self {
        Self {
            max_ceps_per_ces: DEFAULT_MAX_CEPS_PER_CES,
        }
    }
}
