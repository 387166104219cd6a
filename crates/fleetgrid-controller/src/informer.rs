//! Watch dispatch.
//!
//! An [`Informer`] subscribes to a [`WatchSource`], lists every existing
//! object once (delivered as adds), then forwards each typed
//! [`WatchEvent`] to an [`EventHandler`]. A subscriber that falls behind
//! the watch channel relists instead of guessing what it missed.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetgrid_cluster::{
    ClusterClient, ClusterResult, Collection, Instance, Resource, WatchEvent, WatchStream,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// First delay before retrying a failed list.
const LIST_RETRY_BASE: Duration = Duration::from_millis(100);

/// Ceiling for the list retry delay.
const LIST_RETRY_MAX: Duration = Duration::from_secs(30);

/// Anything that can list objects of one kind and stream their changes.
#[async_trait]
pub trait WatchSource<T>: Send + Sync {
    fn watch(&self) -> WatchStream<T>;

    async fn list(&self) -> ClusterResult<Vec<T>>;
}

#[async_trait]
impl<C: ClusterClient + ?Sized> WatchSource<Collection> for C {
    fn watch(&self) -> WatchStream<Collection> {
        self.watch_collections()
    }

    async fn list(&self) -> ClusterResult<Vec<Collection>> {
        self.list_collections().await
    }
}

#[async_trait]
impl<C: ClusterClient + ?Sized> WatchSource<Instance> for C {
    fn watch(&self) -> WatchStream<Instance> {
        self.watch_instances()
    }

    async fn list(&self) -> ClusterResult<Vec<Instance>> {
        self.list_instances().await
    }
}

/// Callbacks invoked for each change of a watched kind.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn on_add(&self, obj: &T);

    async fn on_update(&self, old: &T, new: &T);

    /// `obj` is the last known state of the deleted object.
    async fn on_delete(&self, obj: &T);
}

/// Drives one [`EventHandler`] from one [`WatchSource`].
pub struct Informer<T, S: ?Sized> {
    source: Arc<S>,
    handler: Arc<dyn EventHandler<T>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T, S> Informer<T, S>
where
    T: Resource,
    S: WatchSource<T> + ?Sized,
{
    pub fn new(source: Arc<S>, handler: Arc<dyn EventHandler<T>>) -> Self {
        Self {
            source,
            handler,
            _kind: PhantomData,
        }
    }

    /// Run until `shutdown` fires or the watch closes.
    ///
    /// Change events are only dispatched after a list has succeeded, so
    /// every existing object reaches the handler at least once.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        // Subscribe before listing so nothing written in between is missed.
        let mut stream = self.source.watch();
        if !self.sync(&mut shutdown).await {
            info!(kind = T::KIND, "informer shutting down before first list");
            return;
        }
        info!(kind = T::KIND, "informer started");

        loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Ok(event) => self.dispatch(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kind = T::KIND, skipped, "watch lagged, relisting");
                        if !self.sync(&mut shutdown).await {
                            info!(kind = T::KIND, "informer shutting down");
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!(kind = T::KIND, "watch closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!(kind = T::KIND, "informer shutting down");
                    break;
                }
            }
        }
    }

    /// Relist until it succeeds, backing off between attempts.
    ///
    /// Returns false if `shutdown` fired first.
    async fn sync(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut backoff = LIST_RETRY_BASE;
        loop {
            match self.relist().await {
                Ok(_) => return true,
                Err(e) => {
                    warn!(
                        kind = T::KIND,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "list failed, retrying"
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return false,
            }
            backoff = (backoff * 2).min(LIST_RETRY_MAX);
        }
    }

    /// Deliver every existing object to the handler as an add. Returns the
    /// number of objects listed.
    pub async fn relist(&self) -> ClusterResult<usize> {
        let objects = self.source.list().await?;
        debug!(kind = T::KIND, count = objects.len(), "listed objects");
        for obj in &objects {
            self.handler.on_add(obj).await;
        }
        Ok(objects.len())
    }

    async fn dispatch(&self, event: WatchEvent<T>) {
        match &event {
            WatchEvent::Added(obj) => self.handler.on_add(obj).await,
            WatchEvent::Updated { old, new } => self.handler.on_update(old, new).await,
            WatchEvent::Deleted(obj) => self.handler.on_delete(obj).await,
        }
    }
}
