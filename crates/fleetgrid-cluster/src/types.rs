//! Resource types for the fleet's two workload kinds.
//!
//! A `Collection` declares how many game server instances should exist;
//! an `Instance` is one game server. Ownership is an explicit typed
//! foreign key (`Instance::owner`), not a label.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::events::ObjectReference;

// ── Identity ───────────────────────────────────────────────────────

/// Namespaced identity of a cluster object, rendered as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse a `namespace/name` key. Both parts must be non-empty.
    pub fn parse(key: &str) -> Result<Self, ClusterError> {
        match key.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ClusterError::Invalid(format!(
                "unexpected key format {key:?}, want namespace/name"
            ))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Common surface of watched object kinds.
pub trait Resource: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn key(&self) -> ObjectKey;

    /// Opaque change token, bumped by the cluster on every write.
    fn resource_version(&self) -> u64;

    fn object_ref(&self) -> ObjectReference {
        let key = self.key();
        ObjectReference {
            kind: Self::KIND.to_string(),
            namespace: key.namespace,
            name: key.name,
            resource_version: self.resource_version(),
        }
    }
}

// ── Collection ─────────────────────────────────────────────────────

/// Desired state of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSpec {
    /// Number of instances that should be linked to the collection.
    pub replicas: u32,
    /// Container image every instance runs.
    pub image: String,
    /// Map the game server starts on.
    pub start_map: String,
}

/// A declared group of game server instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub namespace: String,
    pub name: String,
    /// Assigned by the cluster; ignored on create.
    #[serde(default)]
    pub resource_version: u64,
    pub spec: CollectionSpec,
}

impl Collection {
    pub fn new(namespace: &str, name: &str, spec: CollectionSpec) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            resource_version: 0,
            spec,
        }
    }
}

impl Resource for Collection {
    const KIND: &'static str = "Collection";

    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }
}

// ── Instance ───────────────────────────────────────────────────────

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Creating,
    Running,
    MarkedForDeletion,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::MarkedForDeletion => "MarkedForDeletion",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Creating" => Ok(Self::Creating),
            "Running" => Ok(Self::Running),
            "MarkedForDeletion" => Ok(Self::MarkedForDeletion),
            other => Err(ClusterError::Invalid(format!("unknown instance status {other:?}"))),
        }
    }
}

/// One game server workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub resource_version: u64,
    /// Owning collection. `None` once unlinked; never set again after that.
    pub owner: Option<ObjectKey>,
    pub image: String,
    pub start_map: String,
    /// Host port, unique across live instances.
    pub port: u16,
    pub status: InstanceStatus,
    pub active_sessions: u32,
    /// Assigned after placement.
    pub node_name: Option<String>,
    pub public_ip: Option<String>,
}

impl Instance {
    /// Synthesize a new instance for `collection`, linked to it.
    pub fn for_collection(collection: &Collection, name: &str, port: u16) -> Self {
        Self {
            namespace: collection.namespace.clone(),
            name: name.to_string(),
            resource_version: 0,
            owner: Some(collection.key()),
            image: collection.spec.image.clone(),
            start_map: collection.spec.start_map.clone(),
            port,
            status: InstanceStatus::Creating,
            active_sessions: 0,
            node_name: None,
            public_ip: None,
        }
    }

    pub fn is_owned_by(&self, collection: &ObjectKey) -> bool {
        self.owner.as_ref() == Some(collection)
    }

    /// Soft-unlink: drop the owner and mark the instance for deletion.
    ///
    /// The instance keeps running until its sessions drain.
    pub fn unlink(&mut self) {
        self.owner = None;
        self.status = InstanceStatus::MarkedForDeletion;
    }
}

impl Resource for Instance {
    const KIND: &'static str = "Instance";

    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }
}
