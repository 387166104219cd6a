//! Cluster API client trait.

use async_trait::async_trait;

use crate::error::ClusterResult;
use crate::types::{Collection, Instance, ObjectKey};
use crate::watch::WatchStream;

/// Operations the fleet controllers need from the cluster control plane.
///
/// Implementations must be safe for concurrent use: several worker loops
/// call into one client at the same time.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // ── Collections ────────────────────────────────────────────────

    async fn get_collection(&self, key: &ObjectKey) -> ClusterResult<Collection>;

    async fn list_collections(&self) -> ClusterResult<Vec<Collection>>;

    async fn create_collection(&self, collection: Collection) -> ClusterResult<Collection>;

    /// Replace a collection. Fails with `Conflict` on a stale resource version.
    async fn update_collection(&self, collection: Collection) -> ClusterResult<Collection>;

    fn watch_collections(&self) -> WatchStream<Collection>;

    // ── Instances ──────────────────────────────────────────────────

    async fn get_instance(&self, key: &ObjectKey) -> ClusterResult<Instance>;

    async fn list_instances(&self) -> ClusterResult<Vec<Instance>>;

    /// Instances whose owner is exactly `owner`.
    async fn list_instances_owned_by(&self, owner: &ObjectKey) -> ClusterResult<Vec<Instance>>;

    async fn create_instance(&self, instance: Instance) -> ClusterResult<Instance>;

    /// Replace an instance. Fails with `Conflict` on a stale resource version
    /// and with `Invalid` when an unlinked instance would be linked again.
    async fn update_instance(&self, instance: Instance) -> ClusterResult<Instance>;

    async fn delete_instance(&self, key: &ObjectKey) -> ClusterResult<()>;

    fn watch_instances(&self) -> WatchStream<Instance>;
}
