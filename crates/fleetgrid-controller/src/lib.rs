//! fleetgrid-controller — watch-driven reconciliation for FleetGrid.
//!
//! Converges the actual set of game server instances toward each
//! collection's declared replica count.
//!
//! # Architecture
//!
//! ```text
//! ClusterClient watch ──► Informer ──► EventHandler ──► WorkQueue
//!                                                         │ get()
//!                                                         ▼
//!                                      Controller worker loops (N per kind)
//!                                                         │ reconcile(key)
//!                          ┌──────────────────────────────┴──────────┐
//!                          ▼                                         ▼
//!                CollectionReconciler                       InstanceReconciler
//!                  ├── PortAllocator (fleetgrid-state)        └── Recorder
//!                  ├── StateStore mirror rows
//!                  └── Recorder
//!
//! Sweeper ── drained mirror rows ──► delete instance + release port
//! ```
//!
//! # Queue semantics
//!
//! - A key already waiting collapses repeated enqueues into one entry.
//! - A key is handed to at most one worker at a time; a key re-added
//!   while in flight is queued again once the worker calls `done`.
//! - Successful syncs `forget` the key (resetting its backoff); failed
//!   syncs are re-added through the rate limiter; malformed keys are
//!   forgotten and never retried.

pub mod collection;
pub mod controller;
pub mod error;
pub mod informer;
pub mod instance;
pub mod queue;
pub mod rate_limiter;
pub mod sampling;
pub mod sweep;

pub use collection::{CollectionEventHandler, CollectionReconciler};
pub use controller::{Controller, ProcessOutcome, Reconciler};
pub use error::{ControllerError, ControllerResult};
pub use informer::{EventHandler, Informer, WatchSource};
pub use instance::{InstanceEventHandler, InstanceReconciler};
pub use queue::WorkQueue;
pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    RateLimiterConfig,
};
pub use sweep::{SweepReport, Sweeper};
