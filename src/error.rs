use thiserror::Error;

/// Crate-wide error taxonomy. Every public operation returns one of these
/// variants; see `SPEC_FULL.md` §7 for the propagation rules each caller
/// follows.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FactCacheError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("pipeline error: {failed} of {total} operations failed")]
    PipelineError { failed: usize, total: usize },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("source database error: {0}")]
    SourceDbError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("entry too large: {bytes} bytes exceeds limit of {limit} bytes")]
    EntryTooLarge { bytes: usize, limit: usize },

    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error("scan ceiling exceeded for pattern {pattern}")]
    ScanCeilingExceeded { pattern: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for FactCacheError {
    fn from(e: redis::RedisError) -> Self {
        FactCacheError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FactCacheError>;
