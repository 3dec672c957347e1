use thiserror::Error;

/// The storage gateway's single error kind set (§4.A): every operation
/// either succeeds or returns one of these three.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}
