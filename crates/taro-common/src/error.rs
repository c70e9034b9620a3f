//! Error types for the Taro registry core
//!
//! Client-facing registry operations surface these typed failures
//! synchronously; background workers log and continue instead.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum TaroError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer request failed: {0}")]
    TransientPeerFailure(String),

    #[error("consistency operation failed: {0}")]
    ConsistencyFailure(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, TaroError>;

impl TaroError {
    /// True for failures that background workers are allowed to swallow.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaroError::TransientPeerFailure(_))
    }
}
