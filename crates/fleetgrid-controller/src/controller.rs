//! Controller runtime: worker loops that drain a work queue into a
//! reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use fleetgrid_cluster::ObjectKey;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::queue::WorkQueue;

/// Converges one object toward its desired state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Short name used in logs and as the queue name.
    fn name(&self) -> &str;

    /// Reconcile the object at `key`. An `Err` re-queues the key with
    /// backoff; an object that no longer exists should return `Ok`.
    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<()>;
}

/// What happened to one dequeued key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Reconciled; backoff reset.
    Synced,
    /// Reconcile failed; re-added through the rate limiter.
    Requeued,
    /// Malformed key; forgotten without retry.
    Dropped,
}

/// Binds a reconciler to its work queue.
pub struct Controller<R> {
    queue: WorkQueue<String>,
    reconciler: Arc<R>,
}

impl<R> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            reconciler: Arc::clone(&self.reconciler),
        }
    }
}

impl<R: Reconciler> Controller<R> {
    pub fn new(queue: WorkQueue<String>, reconciler: Arc<R>) -> Self {
        Self { queue, reconciler }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Take one key off the queue and reconcile it.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn process_next(&self) -> Option<ProcessOutcome> {
        let raw = self.queue.get().await?;
        let outcome = self.process(&raw).await;
        self.queue.done(&raw).await;
        Some(outcome)
    }

    async fn process(&self, raw: &str) -> ProcessOutcome {
        let controller = self.reconciler.name();
        let raw = raw.to_string();

        let result = match ObjectKey::parse(&raw) {
            Ok(key) => self.reconciler.reconcile(&key).await,
            Err(e) => Err(ControllerError::InvalidKey(e.to_string())),
        };

        match result {
            Ok(()) => {
                self.queue.forget(&raw).await;
                info!(controller, key = %raw, "successfully synced");
                ProcessOutcome::Synced
            }
            Err(e @ ControllerError::InvalidKey(_)) => {
                self.queue.forget(&raw).await;
                error!(controller, key = %raw, error = %e, "dropping malformed key");
                ProcessOutcome::Dropped
            }
            Err(e) => {
                let requeues = self.queue.num_requeues(&raw).await;
                warn!(controller, key = %raw, requeues, error = %e, "sync failed, requeuing");
                self.queue.add_rate_limited(raw).await;
                ProcessOutcome::Requeued
            }
        }
    }

    async fn run_worker(self, id: usize) {
        info!(controller = self.reconciler.name(), worker = id, "worker started");
        while self.process_next().await.is_some() {}
        info!(controller = self.reconciler.name(), worker = id, "worker stopped");
    }

    /// Run `workers` worker loops until `shutdown` fires.
    ///
    /// Shutdown stops the queue; in-flight reconciles run to completion
    /// before this returns.
    pub async fn run(&self, workers: usize, mut shutdown: watch::Receiver<bool>) {
        info!(controller = self.reconciler.name(), workers, "controller started");

        let mut set = JoinSet::new();
        for id in 0..workers.max(1) {
            set.spawn(self.clone().run_worker(id));
        }

        let _ = shutdown.changed().await;
        info!(controller = self.reconciler.name(), "controller shutting down");
        self.queue.shut_down().await;

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(controller = self.reconciler.name(), error = %e, "worker panicked");
            }
        }
    }
}
