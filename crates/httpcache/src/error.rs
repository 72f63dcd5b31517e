use crate::backend::BackendError;
use crate::network::NetError;

/// Errors surfaced by the cache directory and by transactions.
///
/// `Race` is internal: transactions go back and re-acquire their entry when
/// they see it. Callers normally observe `CacheMiss`, `ReadFailure`,
/// `Network` or `InvalidRequest`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry raced with a concurrent open/create/doom")]
    Race,

    #[error("resource is not in the cache")]
    CacheMiss,

    #[error("failed to read from the cache entry")]
    ReadFailure,

    #[error("authentication required after reading part of the body")]
    AuthFailureAfterRead,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("network error: {0}")]
    Network(#[from] NetError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unexpected cache state: {0}")]
    Unexpected(String),
}

impl CacheError {
    /// Whether the error means the transaction should go back and re-acquire its entry.
    pub fn is_race(&self) -> bool {
        matches!(self, CacheError::Race)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, CacheError::Network(e) if e.is_offline())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
