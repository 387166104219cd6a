//! fleetgrid-api — REST API for FleetGrid.
//!
//! Provides axum route handlers for submitting and scaling collections,
//! listing instances, reporting instance status, and reading the drain
//! state kept in the backing store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/collections` | List all collections |
//! | POST | `/api/v1/collections` | Submit a collection |
//! | GET | `/api/v1/collections/{namespace}/{name}` | Get a collection |
//! | POST | `/api/v1/collections/{namespace}/{name}/scale` | Set the replica count |
//! | GET | `/api/v1/instances` | List instances (`?collection=ns/name` filters by owner) |
//! | POST | `/api/v1/instances/{namespace}/{name}/status` | Report instance status |
//! | GET | `/api/v1/entities/running` | Mirror rows with `Status=Running` |
//! | GET | `/api/v1/entities/drained` | Unlinked mirror rows with zero sessions |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_cluster::ClusterClient;
use fleetgrid_state::StateStore;
use serde::{Deserialize, Serialize};

/// Values filled into a submitted collection that omits them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDefaults {
    pub image: String,
    pub start_map: String,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<dyn ClusterClient>,
    pub store: StateStore,
    pub defaults: CollectionDefaults,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/collections",
            get(handlers::list_collections).post(handlers::create_collection),
        )
        .route("/collections/{namespace}/{name}", get(handlers::get_collection))
        .route(
            "/collections/{namespace}/{name}/scale",
            post(handlers::scale_collection),
        )
        .route("/instances", get(handlers::list_instances))
        .route(
            "/instances/{namespace}/{name}/status",
            post(handlers::report_status),
        )
        .route("/entities/running", get(handlers::list_running))
        .route("/entities/drained", get(handlers::list_drained))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
