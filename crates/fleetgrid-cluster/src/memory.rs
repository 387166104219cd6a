//! Single-process implementation of the cluster API.
//!
//! Backs standalone mode and tests. Every write bumps a global resource
//! version and is published on the kind's broadcast watch channel while
//! the write lock is held, so subscribers observe writes in commit order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::AtomicI64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::client::ClusterClient;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{Event, EventSink};
use crate::types::*;
use crate::watch::{WatchEvent, WatchStream};

/// Default capacity of each watch channel.
const WATCH_CAPACITY: usize = 1024;

#[derive(Default)]
struct Objects {
    collections: BTreeMap<ObjectKey, Collection>,
    instances: BTreeMap<ObjectKey, Instance>,
    /// Collection key → keys of the instances it owns.
    owners: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl Objects {
    fn index_owner(&mut self, instance: &Instance) {
        if let Some(owner) = &instance.owner {
            self.owners
                .entry(owner.clone())
                .or_default()
                .insert(instance.key());
        }
    }

    fn unindex_owner(&mut self, instance: &Instance) {
        if let Some(owner) = &instance.owner
            && let Some(owned) = self.owners.get_mut(owner)
        {
            owned.remove(&instance.key());
            if owned.is_empty() {
                self.owners.remove(owner);
            }
        }
    }
}

/// Thread-safe in-memory cluster.
pub struct InMemoryCluster {
    objects: RwLock<Objects>,
    collection_tx: broadcast::Sender<WatchEvent<Collection>>,
    instance_tx: broadcast::Sender<WatchEvent<Instance>>,
    events: Mutex<Vec<Event>>,
    next_version: AtomicU64,
    #[cfg(any(test, feature = "test-util"))]
    hooks: TestHooks,
}

/// Call counters and injected faults.
#[cfg(any(test, feature = "test-util"))]
struct TestHooks {
    instance_creates: AtomicU64,
    instance_updates: AtomicU64,
    /// Remaining instance creates allowed before failing; negative = unlimited.
    create_budget: AtomicI64,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for TestHooks {
    fn default() -> Self {
        Self {
            instance_creates: AtomicU64::new(0),
            instance_updates: AtomicU64::new(0),
            create_budget: AtomicI64::new(-1),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl TestHooks {
    /// Count a create and decide whether it may proceed.
    fn on_instance_create(&self) -> ClusterResult<()> {
        self.instance_creates.fetch_add(1, Ordering::SeqCst);
        let allowed = self
            .create_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                0 => None,
                b if b > 0 => Some(b - 1),
                b => Some(b),
            })
            .is_ok();
        if allowed {
            Ok(())
        } else {
            Err(ClusterError::Unavailable(
                "injected instance create failure".to_string(),
            ))
        }
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_watch_capacity(WATCH_CAPACITY)
    }

    /// Create a cluster whose watch channels buffer `capacity` events per
    /// subscriber before the subscriber lags.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (collection_tx, _) = broadcast::channel(capacity);
        let (instance_tx, _) = broadcast::channel(capacity);
        Self {
            objects: RwLock::new(Objects::default()),
            collection_tx,
            instance_tx,
            events: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(1),
            #[cfg(any(test, feature = "test-util"))]
            hooks: TestHooks::default(),
        }
    }

    /// Events recorded so far, oldest first.
    pub fn recorded_events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `create_instance` calls received.
    #[cfg(any(test, feature = "test-util"))]
    pub fn instance_create_calls(&self) -> u64 {
        self.hooks.instance_creates.load(Ordering::SeqCst)
    }

    /// Number of `update_instance` calls received.
    #[cfg(any(test, feature = "test-util"))]
    pub fn instance_update_calls(&self) -> u64 {
        self.hooks.instance_updates.load(Ordering::SeqCst)
    }

    /// Let the next `n` instance creates succeed, then fail every further
    /// create with `Unavailable`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_instance_creates_after(&self, n: u32) {
        self.hooks
            .create_budget
            .store(i64::from(n), Ordering::SeqCst);
    }

    /// Remove any injected failure.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_faults(&self) {
        self.hooks.create_budget.store(-1, Ordering::SeqCst);
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }
}

fn validate_identity(kind: &str, namespace: &str, name: &str) -> ClusterResult<()> {
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return Err(ClusterError::Invalid(format!(
            "{kind} needs a namespace and a name without '/'"
        )));
    }
    Ok(())
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    // ── Collections ────────────────────────────────────────────────

    async fn get_collection(&self, key: &ObjectKey) -> ClusterResult<Collection> {
        let objects = self.objects.read().await;
        objects
            .collections
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: Collection::KIND,
                key: key.to_string(),
            })
    }

    async fn list_collections(&self) -> ClusterResult<Vec<Collection>> {
        let objects = self.objects.read().await;
        Ok(objects.collections.values().cloned().collect())
    }

    async fn create_collection(&self, mut collection: Collection) -> ClusterResult<Collection> {
        validate_identity(Collection::KIND, &collection.namespace, &collection.name)?;
        let key = collection.key();
        let mut objects = self.objects.write().await;
        if objects.collections.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: Collection::KIND,
                key: key.to_string(),
            });
        }
        collection.resource_version = self.bump_version();
        objects.collections.insert(key.clone(), collection.clone());
        let _ = self.collection_tx.send(WatchEvent::Added(collection.clone()));
        debug!(%key, "collection created");
        Ok(collection)
    }

    async fn update_collection(&self, mut collection: Collection) -> ClusterResult<Collection> {
        let key = collection.key();
        let mut objects = self.objects.write().await;
        let old = objects
            .collections
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: Collection::KIND,
                key: key.to_string(),
            })?;
        if old.resource_version != collection.resource_version {
            return Err(ClusterError::Conflict {
                kind: Collection::KIND,
                key: key.to_string(),
            });
        }
        collection.resource_version = self.bump_version();
        objects.collections.insert(key.clone(), collection.clone());
        let _ = self.collection_tx.send(WatchEvent::Updated {
            old,
            new: collection.clone(),
        });
        debug!(%key, replicas = collection.spec.replicas, "collection updated");
        Ok(collection)
    }

    fn watch_collections(&self) -> WatchStream<Collection> {
        self.collection_tx.subscribe()
    }

    // ── Instances ──────────────────────────────────────────────────

    async fn get_instance(&self, key: &ObjectKey) -> ClusterResult<Instance> {
        let objects = self.objects.read().await;
        objects
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: Instance::KIND,
                key: key.to_string(),
            })
    }

    async fn list_instances(&self) -> ClusterResult<Vec<Instance>> {
        let objects = self.objects.read().await;
        Ok(objects.instances.values().cloned().collect())
    }

    async fn list_instances_owned_by(&self, owner: &ObjectKey) -> ClusterResult<Vec<Instance>> {
        let objects = self.objects.read().await;
        let Some(owned) = objects.owners.get(owner) else {
            return Ok(Vec::new());
        };
        Ok(owned
            .iter()
            .filter_map(|key| objects.instances.get(key))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, mut instance: Instance) -> ClusterResult<Instance> {
        #[cfg(any(test, feature = "test-util"))]
        self.hooks.on_instance_create()?;
        validate_identity(Instance::KIND, &instance.namespace, &instance.name)?;

        let key = instance.key();
        let mut objects = self.objects.write().await;
        if objects.instances.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: Instance::KIND,
                key: key.to_string(),
            });
        }
        instance.resource_version = self.bump_version();
        objects.index_owner(&instance);
        objects.instances.insert(key.clone(), instance.clone());
        let _ = self.instance_tx.send(WatchEvent::Added(instance.clone()));
        debug!(%key, port = instance.port, "instance created");
        Ok(instance)
    }

    async fn update_instance(&self, mut instance: Instance) -> ClusterResult<Instance> {
        #[cfg(any(test, feature = "test-util"))]
        self.hooks.instance_updates.fetch_add(1, Ordering::SeqCst);
        let key = instance.key();
        let mut objects = self.objects.write().await;
        let old = objects
            .instances
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: Instance::KIND,
                key: key.to_string(),
            })?;
        if old.resource_version != instance.resource_version {
            return Err(ClusterError::Conflict {
                kind: Instance::KIND,
                key: key.to_string(),
            });
        }
        if instance.owner.is_some() && instance.owner != old.owner {
            return Err(ClusterError::Invalid(format!(
                "instance {key} cannot be linked to a collection after creation"
            )));
        }

        instance.resource_version = self.bump_version();
        objects.unindex_owner(&old);
        objects.index_owner(&instance);
        objects.instances.insert(key.clone(), instance.clone());
        let _ = self.instance_tx.send(WatchEvent::Updated {
            old,
            new: instance.clone(),
        });
        debug!(%key, status = %instance.status, "instance updated");
        Ok(instance)
    }

    async fn delete_instance(&self, key: &ObjectKey) -> ClusterResult<()> {
        let mut objects = self.objects.write().await;
        let removed = objects
            .instances
            .remove(key)
            .ok_or_else(|| ClusterError::NotFound {
                kind: Instance::KIND,
                key: key.to_string(),
            })?;
        objects.unindex_owner(&removed);
        let _ = self.instance_tx.send(WatchEvent::Deleted(removed));
        debug!(%key, "instance deleted");
        Ok(())
    }

    fn watch_instances(&self) -> WatchStream<Instance> {
        self.instance_tx.subscribe()
    }
}

impl EventSink for InMemoryCluster {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: u32) -> CollectionSpec {
        CollectionSpec {
            replicas,
            image: "openarena:0.0.1".to_string(),
            start_map: "dm4ish".to_string(),
        }
    }

    #[tokio::test]
    async fn owner_index_tracks_links() {
        let cluster = InMemoryCluster::new();
        let col = cluster
            .create_collection(Collection::new("default", "arena", spec(2)))
            .await
            .unwrap();
        let other = Collection::new("default", "other", spec(1));

        cluster
            .create_instance(Instance::for_collection(&col, "arena-a", 20001))
            .await
            .unwrap();
        cluster
            .create_instance(Instance::for_collection(&col, "arena-b", 20002))
            .await
            .unwrap();
        cluster
            .create_instance(Instance::for_collection(&other, "other-a", 20003))
            .await
            .unwrap();

        let owned = cluster.list_instances_owned_by(&col.key()).await.unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|i| i.is_owned_by(&col.key())));

        let mut unlinked = cluster
            .get_instance(&ObjectKey::new("default", "arena-a"))
            .await
            .unwrap();
        unlinked.unlink();
        cluster.update_instance(unlinked).await.unwrap();

        let owned = cluster.list_instances_owned_by(&col.key()).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "arena-b");
        assert_eq!(cluster.list_instances().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unlinked_instance_cannot_be_relinked() {
        let cluster = InMemoryCluster::new();
        let col = Collection::new("default", "arena", spec(1));
        let created = cluster
            .create_instance(Instance::for_collection(&col, "arena-a", 20001))
            .await
            .unwrap();

        let mut inst = created.clone();
        inst.unlink();
        let mut unlinked = cluster.update_instance(inst).await.unwrap();

        unlinked.owner = Some(col.key());
        let err = cluster.update_instance(unlinked).await.unwrap_err();
        assert!(matches!(err, ClusterError::Invalid(_)));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = InMemoryCluster::new();
        let created = cluster
            .create_collection(Collection::new("default", "arena", spec(1)))
            .await
            .unwrap();

        let mut first = created.clone();
        first.spec.replicas = 3;
        cluster.update_collection(first).await.unwrap();

        let mut stale = created;
        stale.spec.replicas = 5;
        let err = cluster.update_collection(stale).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));
    }

    #[tokio::test]
    async fn writes_are_published_in_order() {
        let cluster = InMemoryCluster::new();
        let mut watch = cluster.watch_collections();

        let created = cluster
            .create_collection(Collection::new("default", "arena", spec(1)))
            .await
            .unwrap();
        let mut scaled = created.clone();
        scaled.spec.replicas = 4;
        cluster.update_collection(scaled).await.unwrap();

        match watch.recv().await.unwrap() {
            WatchEvent::Added(c) => assert_eq!(c.spec.replicas, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match watch.recv().await.unwrap() {
            WatchEvent::Updated { old, new } => {
                assert_eq!(old.spec.replicas, 1);
                assert_eq!(new.spec.replicas, 4);
                assert!(new.resource_version > old.resource_version);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_publishes_last_state() {
        let cluster = InMemoryCluster::new();
        let col = Collection::new("default", "arena", spec(1));
        cluster
            .create_instance(Instance::for_collection(&col, "arena-a", 20001))
            .await
            .unwrap();
        let mut watch = cluster.watch_instances();

        let key = ObjectKey::new("default", "arena-a");
        cluster.delete_instance(&key).await.unwrap();
        match watch.recv().await.unwrap() {
            WatchEvent::Deleted(inst) => assert_eq!(inst.port, 20001),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(cluster.delete_instance(&key).await.unwrap_err().is_not_found());
        assert!(cluster.list_instances_owned_by(&col.key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_create_failures() {
        let cluster = InMemoryCluster::new();
        let col = Collection::new("default", "arena", spec(3));
        cluster.fail_instance_creates_after(1);

        cluster
            .create_instance(Instance::for_collection(&col, "arena-a", 20001))
            .await
            .unwrap();
        let err = cluster
            .create_instance(Instance::for_collection(&col, "arena-b", 20002))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable(_)));
        assert_eq!(cluster.instance_create_calls(), 2);

        cluster.clear_faults();
        cluster
            .create_instance(Instance::for_collection(&col, "arena-b", 20002))
            .await
            .unwrap();
    }
}
