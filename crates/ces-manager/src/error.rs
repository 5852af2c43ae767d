use thiserror::Error;

/// Endpoint slice allocation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CesError {
    #[error("endpoint {0} is not mapped to any slice")]
    NotFound(String),

    #[error("slice capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}

pub type Result<T> = std::result::Result<T, CesError>;
