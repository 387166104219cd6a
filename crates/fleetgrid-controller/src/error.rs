//! Controller error types.

use fleetgrid_cluster::ClusterError;
use fleetgrid_state::{PortError, StateError};
use thiserror::Error;

/// Errors returned from a reconcile pass.
///
/// `InvalidKey` is permanent: the key is dropped without retry. Anything
/// else other than a benign absence is transient and the key is re-queued
/// with backoff.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cluster api error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("port allocation error: {0}")]
    Port(#[from] PortError),

    /// A queue item that does not name an object.
    #[error("invalid resource key: {0}")]
    InvalidKey(String),
}

impl ControllerError {
    /// Whether the error means the target no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_not_found(),
            Self::State(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
