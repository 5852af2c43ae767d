use thiserror::Error;

/// DNS proxy errors.
#[derive(Debug, Error)]
pub enum DnsProxyError {
    #[error("invalid DNS pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, DnsProxyError>;
