//! Cluster API error types.

use thiserror::Error;

/// Errors returned by a cluster API client.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    /// The write was based on a stale resource version.
    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: &'static str, key: String },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("cluster api unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
