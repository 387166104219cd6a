//! fleetgrid-cluster — the cluster control-plane API as seen by FleetGrid.
//!
//! The fleet controllers never talk to a specific API server. They depend on:
//!
//! - [`ClusterClient`]: get/create/update/delete of `Collection` and
//!   `Instance` objects by `namespace/name`, plus an indexed
//!   "instances owned by collection X" lookup.
//! - Typed watch streams of [`WatchEvent`]s (`Added` / `Updated` / `Deleted`).
//! - An [`EventSink`] that accepts recorded events, wrapped by a
//!   per-controller [`Recorder`].
//!
//! [`InMemoryCluster`] implements all of these and backs standalone mode
//! and tests.
//!
//! # Architecture
//!
//! ```text
//! InMemoryCluster
//!   ├── collections: ObjectKey → Collection
//!   ├── instances:   ObjectKey → Instance
//!   ├── owner index: collection key → instance keys
//!   ├── broadcast watch channels (one per kind)
//!   └── recorded events
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod memory;
pub mod types;
pub mod watch;

pub use client::ClusterClient;
pub use error::{ClusterError, ClusterResult};
pub use events::{
    Event, EventRecorder, EventSink, EventType, ObjectReference, REASON_SYNCED, Recorder,
};
pub use memory::InMemoryCluster;
pub use types::*;
pub use watch::{WatchEvent, WatchStream};
