//! Instance reconciler: observes instance changes and records a sync
//! event for each. Status fields are written by the status reporting path
//! and cleanup is left to the drain sweep.

use std::sync::Arc;

use async_trait::async_trait;
use fleetgrid_cluster::{
    ClusterClient, EventRecorder, EventType, Instance, ObjectKey, REASON_SYNCED, Resource,
};
use tracing::debug;

use crate::controller::Reconciler;
use crate::error::ControllerResult;
use crate::informer::EventHandler;
use crate::queue::WorkQueue;

pub const COMPONENT: &str = "instance-controller";

const MESSAGE_SYNCED: &str = "Instance synced successfully";

pub struct InstanceReconciler {
    cluster: Arc<dyn ClusterClient>,
    recorder: Arc<dyn EventRecorder>,
}

impl InstanceReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { cluster, recorder }
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    fn name(&self) -> &str {
        COMPONENT
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<()> {
        let instance = match self.cluster.get_instance(key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                debug!(%key, "instance no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.recorder.event(
            &instance.object_ref(),
            EventType::Normal,
            REASON_SYNCED,
            MESSAGE_SYNCED,
        );
        Ok(())
    }
}

/// Enqueues instance keys on add and update.
pub struct InstanceEventHandler {
    queue: WorkQueue<String>,
}

impl InstanceEventHandler {
    pub fn new(queue: WorkQueue<String>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler<Instance> for InstanceEventHandler {
    async fn on_add(&self, obj: &Instance) {
        self.queue.add(obj.key().to_string()).await;
    }

    async fn on_update(&self, _old: &Instance, new: &Instance) {
        self.queue.add(new.key().to_string()).await;
    }

    async fn on_delete(&self, obj: &Instance) {
        debug!(key = %obj.key(), port = obj.port, "instance deleted");
    }
}
