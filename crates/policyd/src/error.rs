use std::path::PathBuf;
use thiserror::Error;

/// Driver errors.
#[derive(Debug, Error)]
pub enum PolicydError {
    #[error("failed to read scenario {path}: {source}")]
    ReadScenario {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario: {0}")]
    InvalidScenario(#[from] serde_json::Error),

    #[error("duplicate endpoint id {0}")]
    DuplicateEndpoint(u64),

    #[error(transparent)]
    Ces(#[from] ces_manager::CesError),

    #[error("stream task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PolicydError>;
