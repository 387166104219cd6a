//! Collection reconciler: converges the number of instances linked to a
//! collection toward its declared replica count.
//!
//! Each pass recomputes the diff from the cluster's current state, so a
//! pass that failed halfway is finished by the retry:
//!
//! - **Scale up**: reserve a port, write its mirror row
//!   `{Port, Status=Creating}`, then create an instance linked to the
//!   collection.
//! - **Scale down**: pick instances uniformly at random and soft-unlink
//!   them (owner cleared, status `MarkedForDeletion`). They keep their
//!   port and keep running until the drain sweep removes them.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use fleetgrid_cluster::{
    ClusterClient, Collection, EventRecorder, EventType, Instance, ObjectKey, REASON_SYNCED,
    Resource,
};
use fleetgrid_state::{
    GameServerEntity, PortAllocator, PortRange, STATUS_CREATING, STATUS_MARKED_FOR_DELETION,
    StateError, StateStore,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::controller::Reconciler;
use crate::error::ControllerResult;
use crate::informer::EventHandler;
use crate::queue::WorkQueue;
use crate::sampling::{random_suffix, sample_indices};

/// Component name for logs, events and the work queue.
pub const COMPONENT: &str = "collection-controller";

const MESSAGE_SYNCED: &str = "Collection synced successfully";

/// Length of the random suffix appended to new instance names.
const NAME_SUFFIX_LEN: usize = 5;

/// Names drawn before giving up on finding an unused one.
const NAME_ATTEMPTS: usize = 8;

pub struct CollectionReconciler {
    cluster: Arc<dyn ClusterClient>,
    store: StateStore,
    ports: PortAllocator,
    port_range: PortRange,
    recorder: Arc<dyn EventRecorder>,
}

impl CollectionReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        store: StateStore,
        port_range: PortRange,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            cluster,
            ports: PortAllocator::new(store.clone()),
            store,
            port_range,
            recorder,
        }
    }

    /// Draw instance names until one has no mirror row yet.
    fn fresh_name(&self, collection: &Collection, rng: &mut impl Rng) -> ControllerResult<String> {
        for _ in 0..NAME_ATTEMPTS {
            let name = format!(
                "{}-{}",
                collection.name,
                random_suffix(rng, NAME_SUFFIX_LEN)
            );
            match self.store.get_entity(&collection.namespace, &name) {
                Err(e) if e.is_not_found() => return Ok(name),
                Err(e) => return Err(e.into()),
                Ok(_) => debug!(instance = %name, "instance name taken, drawing again"),
            }
        }
        Err(StateError::Conflict(format!("no free instance name for {}", collection.key())).into())
    }

    async fn scale_up(&self, collection: &Collection, count: usize) -> ControllerResult<()> {
        let owner = collection.key();
        for _ in 0..count {
            let (port, name) = {
                let mut rng = rand::rng();
                let name = self.fresh_name(collection, &mut rng)?;
                let port = self.ports.allocate_in(self.port_range, &mut rng)?;
                (port, name)
            };

            // The row goes first so the port is always discoverable by cleanup.
            let row = GameServerEntity::new(&collection.namespace, &name)
                .with_port(port)
                .with_status(STATUS_CREATING)
                .with_active_sessions(0);
            if let Err(e) = self.store.upsert_entity(&row) {
                if let Err(release_err) = self.ports.release(port) {
                    warn!(port, error = %release_err, "failed to release port after row write failure");
                }
                return Err(e.into());
            }

            let instance = Instance::for_collection(collection, &name, port);
            if let Err(e) = self.cluster.create_instance(instance).await {
                // Nothing claims the port; drop the row and the port together.
                if let Err(cleanup_err) = self.store.delete_instance(&collection.namespace, &name) {
                    warn!(port, error = %cleanup_err, "failed to clean up after create failure");
                }
                return Err(e.into());
            }

            info!(collection = %owner, instance = %name, port, "instance created");
        }
        Ok(())
    }

    async fn scale_down(
        &self,
        collection: &Collection,
        instances: &[Instance],
        count: usize,
    ) -> ControllerResult<()> {
        let owner = collection.key();
        let picks = {
            let mut rng = rand::rng();
            sample_indices(&mut rng, instances.len(), count)
        };

        for index in picks {
            let mut instance = instances[index].clone();
            instance.unlink();
            let unlinked = self.cluster.update_instance(instance).await?;

            self.store.upsert_entity(
                &GameServerEntity::new(&unlinked.namespace, &unlinked.name)
                    .with_port(unlinked.port)
                    .with_status(STATUS_MARKED_FOR_DELETION)
                    .with_active_sessions(unlinked.active_sessions),
            )?;
            info!(
                collection = %owner,
                instance = %unlinked.name,
                port = unlinked.port,
                "instance unlinked"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CollectionReconciler {
    fn name(&self) -> &str {
        COMPONENT
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<()> {
        let collection = match self.cluster.get_collection(key).await {
            Ok(collection) => collection,
            Err(e) if e.is_not_found() => {
                debug!(%key, "collection no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let instances = self.cluster.list_instances_owned_by(key).await?;
        let desired = collection.spec.replicas as usize;
        let actual = instances.len();

        match desired.cmp(&actual) {
            Ordering::Greater => {
                debug!(%key, desired, actual, "scaling up");
                self.scale_up(&collection, desired - actual).await?;
            }
            Ordering::Less => {
                debug!(%key, desired, actual, "scaling down");
                self.scale_down(&collection, &instances, actual - desired)
                    .await?;
            }
            Ordering::Equal => {}
        }

        self.recorder.event(
            &collection.object_ref(),
            EventType::Normal,
            REASON_SYNCED,
            MESSAGE_SYNCED,
        );
        Ok(())
    }
}

// ── Watch handler ──────────────────────────────────────────────────

/// Whether an update can change the scaling decision.
///
/// Skips resyncs that carry the same resource version and updates that
/// leave the replica count alone.
pub fn needs_resync(old: &Collection, new: &Collection) -> bool {
    old.resource_version != new.resource_version && old.spec.replicas != new.spec.replicas
}

/// Enqueues collection keys from watch events.
pub struct CollectionEventHandler {
    queue: WorkQueue<String>,
}

impl CollectionEventHandler {
    pub fn new(queue: WorkQueue<String>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler<Collection> for CollectionEventHandler {
    async fn on_add(&self, obj: &Collection) {
        self.queue.add(obj.key().to_string()).await;
    }

    async fn on_update(&self, old: &Collection, new: &Collection) {
        if needs_resync(old, new) {
            self.queue.add(new.key().to_string()).await;
        }
    }

    async fn on_delete(&self, obj: &Collection) {
        debug!(key = %obj.key(), "collection deleted");
    }
}
