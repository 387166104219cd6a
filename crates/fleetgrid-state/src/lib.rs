//! fleetgrid-state — backing store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the two row sets the
//! fleet controllers depend on:
//!
//! - **Port registry**: one row per port in use. The existence of a row is
//!   the only source of truth for port availability, and a conditional
//!   insert is the only mutual-exclusion primitive.
//! - **Entity mirror**: sparse game server rows keyed by `{namespace}/{name}`
//!   used for session-draining queries (`Running`, drained
//!   `MarkedForDeletion` rows).
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod ports;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use ports::{PortAllocator, PortError, PortRange};
pub use store::StateStore;
pub use types::*;
