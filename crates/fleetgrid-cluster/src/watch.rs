//! Typed watch events.

use tokio::sync::broadcast;

use crate::types::{ObjectKey, Resource};

/// A change to one watched object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    /// Carries the last known state of the removed object.
    Deleted(T),
}

impl<T: Resource> WatchEvent<T> {
    /// Key of the object the event is about.
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj.key(),
            Self::Updated { new, .. } => new.key(),
        }
    }
}

/// Receiving half of a watch. A subscriber that falls behind observes
/// `RecvError::Lagged` and is expected to relist.
pub type WatchStream<T> = broadcast::Receiver<WatchEvent<T>>;
