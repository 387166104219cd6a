//! REST API handlers.
//!
//! Collection and instance handlers go through the `ClusterClient`; the
//! reconcilers pick up every change from the watch. Entity handlers read
//! the mirror rows in the `StateStore`.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleetgrid_cluster::{
    ClusterError, Collection, CollectionSpec, Instance, InstanceStatus, ObjectKey, Resource,
};
use fleetgrid_state::{GameServerEntity, StateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn cluster_status(e: &ClusterError) -> StatusCode {
    match e {
        ClusterError::NotFound { .. } => StatusCode::NOT_FOUND,
        ClusterError::AlreadyExists { .. } | ClusterError::Conflict { .. } => StatusCode::CONFLICT,
        ClusterError::Invalid(_) => StatusCode::BAD_REQUEST,
        ClusterError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn cluster_error(e: ClusterError) -> axum::response::Response {
    error_response(&e.to_string(), cluster_status(&e)).into_response()
}

fn state_error(e: StateError) -> axum::response::Response {
    let status = match &e {
        StateError::Validation(_) => StatusCode::BAD_REQUEST,
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── Collections ────────────────────────────────────────────────

/// Collection submission body. Image and map fall back to the configured
/// defaults.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCollectionRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    pub replicas: u32,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub start_map: Option<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// GET /api/v1/collections
pub async fn list_collections(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.list_collections().await {
        Ok(collections) => ApiResponse::ok(collections).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// POST /api/v1/collections
pub async fn create_collection(
    State(state): State<ApiState>,
    Json(req): Json<CreateCollectionRequest>,
) -> impl IntoResponse {
    if ObjectKey::parse(&format!("{}/{}", req.namespace, req.name)).is_err() {
        return error_response("namespace and name must be non-empty", StatusCode::BAD_REQUEST)
            .into_response();
    }

    let spec = CollectionSpec {
        replicas: req.replicas,
        image: req.image.unwrap_or_else(|| state.defaults.image.clone()),
        start_map: req.start_map.unwrap_or_else(|| state.defaults.start_map.clone()),
    };
    let collection = Collection::new(&req.namespace, &req.name, spec);

    match state.cluster.create_collection(collection).await {
        Ok(created) => {
            info!(key = %created.key(), replicas = created.spec.replicas, "collection submitted");
            (StatusCode::CREATED, ApiResponse::ok(created)).into_response()
        }
        Err(e) => cluster_error(e),
    }
}

/// GET /api/v1/collections/{namespace}/{name}
pub async fn get_collection(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state
        .cluster
        .get_collection(&ObjectKey::new(&namespace, &name))
        .await
    {
        Ok(collection) => ApiResponse::ok(collection).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// Scale request body.
#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

/// POST /api/v1/collections/{namespace}/{name}/scale
pub async fn scale_collection(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    let key = ObjectKey::new(&namespace, &name);
    let mut collection = match state.cluster.get_collection(&key).await {
        Ok(collection) => collection,
        Err(e) => return cluster_error(e),
    };

    let from = collection.spec.replicas;
    collection.spec.replicas = req.replicas;
    match state.cluster.update_collection(collection).await {
        Ok(updated) => {
            info!(%key, from, to = req.replicas, "collection scaled");
            ApiResponse::ok(updated).into_response()
        }
        Err(e) => cluster_error(e),
    }
}

// ── Instances ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InstanceQuery {
    /// `namespace/name` of the owning collection.
    pub collection: Option<String>,
}

/// GET /api/v1/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(query): Query<InstanceQuery>,
) -> impl IntoResponse {
    let result = match query.collection {
        Some(raw) => match ObjectKey::parse(&raw) {
            Ok(owner) => state.cluster.list_instances_owned_by(&owner).await,
            Err(e) => return cluster_error(e),
        },
        None => state.cluster.list_instances().await,
    };

    match result {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// Sparse status report from a game server. Absent fields are left alone.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: Option<String>,
    pub active_sessions: Option<u32>,
    pub public_ip: Option<String>,
    pub node_name: Option<String>,
}

/// Attempts at applying a status report before giving up on conflicts.
const STATUS_REPORT_ATTEMPTS: usize = 3;

/// POST /api/v1/instances/{namespace}/{name}/status
///
/// Updates the instance first and patches the mirror row from the stored
/// result. An instance already marked for deletion keeps that status so it
/// stays in the drain set.
pub async fn report_status(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(report): Json<StatusReport>,
) -> impl IntoResponse {
    let reported = match report.status.as_deref().map(str::parse::<InstanceStatus>) {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return cluster_error(e),
        None => None,
    };

    let key = ObjectKey::new(&namespace, &name);
    let mut attempt = 0;
    let updated = loop {
        attempt += 1;
        let mut instance = match state.cluster.get_instance(&key).await {
            Ok(instance) => instance,
            Err(e) => return cluster_error(e),
        };
        apply_report(&mut instance, reported, &report);

        match state.cluster.update_instance(instance).await {
            Ok(updated) => break updated,
            Err(e @ ClusterError::Conflict { .. }) if attempt < STATUS_REPORT_ATTEMPTS => {
                debug!(%key, attempt, error = %e, "status report raced a write, retrying");
            }
            Err(e) => return cluster_error(e),
        }
    };

    let mut patch = GameServerEntity::new(&namespace, &name).with_status(updated.status.as_str());
    if let Some(sessions) = report.active_sessions {
        patch = patch.with_active_sessions(sessions);
    }
    if let Some(ip) = &report.public_ip {
        patch = patch.with_public_ip(ip);
    }
    if let Some(node) = &report.node_name {
        patch = patch.with_node_name(node);
    }
    if let Err(e) = state.store.upsert_entity(&patch) {
        return state_error(e);
    }

    // An unlink that landed between the update and the row write must win.
    if updated.status != InstanceStatus::MarkedForDeletion
        && let Ok(current) = state.cluster.get_instance(&key).await
        && current.status == InstanceStatus::MarkedForDeletion
    {
        let marked = GameServerEntity::new(&namespace, &name)
            .with_status(InstanceStatus::MarkedForDeletion.as_str());
        if let Err(e) = state.store.upsert_entity(&marked) {
            return state_error(e);
        }
    }

    debug!(
        %key,
        status = %updated.status,
        sessions = updated.active_sessions,
        "status reported"
    );
    ApiResponse::ok(updated).into_response()
}

/// Copy the reported fields onto `instance`. A `MarkedForDeletion` status
/// is never replaced.
fn apply_report(instance: &mut Instance, reported: Option<InstanceStatus>, report: &StatusReport) {
    if let Some(status) = reported
        && instance.status != InstanceStatus::MarkedForDeletion
    {
        instance.status = status;
    }
    if let Some(sessions) = report.active_sessions {
        instance.active_sessions = sessions;
    }
    if let Some(ip) = &report.public_ip {
        instance.public_ip = Some(ip.clone());
    }
    if let Some(node) = &report.node_name {
        instance.node_name = Some(node.clone());
    }
}

// ── Entities ───────────────────────────────────────────────────

/// GET /api/v1/entities/running
pub async fn list_running(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.query_running() {
        Ok(rows) => ApiResponse::ok(rows).into_response(),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/entities/drained
pub async fn list_drained(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.query_marked_for_deletion_zero_sessions() {
        Ok(rows) => ApiResponse::ok(rows).into_response(),
        Err(e) => state_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CollectionDefaults;
    use async_trait::async_trait;
    use fleetgrid_cluster::{ClusterClient, ClusterResult, InMemoryCluster, WatchStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use fleetgrid_state::{STATUS_MARKED_FOR_DELETION, StateStore};
    use std::sync::Arc;

    fn test_state() -> (ApiState, Arc<InMemoryCluster>) {
        let cluster = Arc::new(InMemoryCluster::new());
        let state = ApiState {
            cluster: cluster.clone(),
            store: StateStore::open_in_memory().unwrap(),
            defaults: CollectionDefaults {
                image: "openarena:0.0.1".to_string(),
                start_map: "dm4ish".to_string(),
            },
        };
        (state, cluster)
    }

    async fn seed_instance(cluster: &InMemoryCluster) -> Instance {
        let col = Collection::new(
            "default",
            "arena",
            CollectionSpec {
                replicas: 1,
                image: "openarena".to_string(),
                start_map: "dm4ish".to_string(),
            },
        );
        cluster
            .create_instance(Instance::for_collection(&col, "arena-ab12c", 20000))
            .await
            .unwrap()
    }

    #[test]
    fn cluster_errors_map_to_http_statuses() {
        let key = "default/arena".to_string();
        assert_eq!(
            cluster_status(&ClusterError::NotFound { kind: "Collection", key: key.clone() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            cluster_status(&ClusterError::Conflict { kind: "Collection", key }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            cluster_status(&ClusterError::Invalid("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn create_fills_defaults() {
        let (state, cluster) = test_state();
        let req = CreateCollectionRequest {
            namespace: default_namespace(),
            name: "arena".to_string(),
            replicas: 3,
            image: None,
            start_map: None,
        };

        let resp = create_collection(State(state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let stored = cluster
            .get_collection(&ObjectKey::new("default", "arena"))
            .await
            .unwrap();
        assert_eq!(stored.spec.image, "openarena:0.0.1");
        assert_eq!(stored.spec.start_map, "dm4ish");
    }

    #[tokio::test]
    async fn create_rejects_empty_name() {
        let (state, _) = test_state();
        let req = CreateCollectionRequest {
            namespace: default_namespace(),
            name: String::new(),
            replicas: 1,
            image: None,
            start_map: None,
        };
        let resp = create_collection(State(state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_report_patches_row_and_instance() {
        let (state, cluster) = test_state();
        let inst = seed_instance(&cluster).await;

        let report = StatusReport {
            status: Some("Running".to_string()),
            active_sessions: Some(3),
            public_ip: Some("10.0.0.7".to_string()),
            node_name: None,
        };
        let resp = report_status(
            State(state.clone()),
            Path(("default".to_string(), inst.name.clone())),
            Json(report),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let row = state.store.get_entity("default", &inst.name).unwrap();
        assert_eq!(row.status.as_deref(), Some("Running"));
        assert_eq!(row.active_sessions.as_deref(), Some("3"));
        assert_eq!(row.public_ip.as_deref(), Some("10.0.0.7"));
        assert!(row.node_name.is_none());

        let updated = cluster.get_instance(&inst.key()).await.unwrap();
        assert_eq!(updated.status, InstanceStatus::Running);
        assert_eq!(updated.active_sessions, 3);
    }

    #[tokio::test]
    async fn status_report_cannot_revive_marked_instance() {
        let (state, cluster) = test_state();
        let mut inst = seed_instance(&cluster).await;
        inst.unlink();
        let inst = cluster.update_instance(inst).await.unwrap();
        state
            .store
            .upsert_entity(
                &GameServerEntity::new("default", &inst.name).with_status(STATUS_MARKED_FOR_DELETION),
            )
            .unwrap();

        let report = StatusReport {
            status: Some("Running".to_string()),
            active_sessions: Some(0),
            ..StatusReport::default()
        };
        let resp = report_status(
            State(state.clone()),
            Path(("default".to_string(), inst.name.clone())),
            Json(report),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let row = state.store.get_entity("default", &inst.name).unwrap();
        assert_eq!(row.status.as_deref(), Some(STATUS_MARKED_FOR_DELETION));
        assert_eq!(
            cluster.get_instance(&inst.key()).await.unwrap().status,
            InstanceStatus::MarkedForDeletion
        );
        assert_eq!(state.store.query_marked_for_deletion_zero_sessions().unwrap().len(), 1);
    }

    /// Cluster that unlinks the instance right after the first lookup,
    /// the way a concurrent scale-down would.
    struct UnlinkAfterFirstGet {
        inner: Arc<InMemoryCluster>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl ClusterClient for UnlinkAfterFirstGet {
        async fn get_collection(&self, key: &ObjectKey) -> ClusterResult<Collection> {
            self.inner.get_collection(key).await
        }
        async fn list_collections(&self) -> ClusterResult<Vec<Collection>> {
            self.inner.list_collections().await
        }
        async fn create_collection(&self, c: Collection) -> ClusterResult<Collection> {
            self.inner.create_collection(c).await
        }
        async fn update_collection(&self, c: Collection) -> ClusterResult<Collection> {
            self.inner.update_collection(c).await
        }
        fn watch_collections(&self) -> WatchStream<Collection> {
            self.inner.watch_collections()
        }
        async fn get_instance(&self, key: &ObjectKey) -> ClusterResult<Instance> {
            let found = self.inner.get_instance(key).await?;
            if !self.fired.swap(true, Ordering::SeqCst) {
                let mut unlinked = found.clone();
                unlinked.unlink();
                self.inner.update_instance(unlinked).await?;
            }
            Ok(found)
        }
        async fn list_instances(&self) -> ClusterResult<Vec<Instance>> {
            self.inner.list_instances().await
        }
        async fn list_instances_owned_by(&self, owner: &ObjectKey) -> ClusterResult<Vec<Instance>> {
            self.inner.list_instances_owned_by(owner).await
        }
        async fn create_instance(&self, i: Instance) -> ClusterResult<Instance> {
            self.inner.create_instance(i).await
        }
        async fn update_instance(&self, i: Instance) -> ClusterResult<Instance> {
            self.inner.update_instance(i).await
        }
        async fn delete_instance(&self, key: &ObjectKey) -> ClusterResult<()> {
            self.inner.delete_instance(key).await
        }
        fn watch_instances(&self) -> WatchStream<Instance> {
            self.inner.watch_instances()
        }
    }

    #[tokio::test]
    async fn status_report_racing_unlink_keeps_row_drainable() {
        let (mut state, cluster) = test_state();
        let inst = seed_instance(&cluster).await;
        state
            .store
            .upsert_entity(
                &GameServerEntity::new("default", &inst.name)
                    .with_port(inst.port)
                    .with_active_sessions(0),
            )
            .unwrap();
        state.cluster = Arc::new(UnlinkAfterFirstGet {
            inner: cluster.clone(),
            fired: AtomicBool::new(false),
        });

        let report = StatusReport {
            status: Some("Running".to_string()),
            active_sessions: Some(0),
            ..StatusReport::default()
        };
        let resp = report_status(
            State(state.clone()),
            Path(("default".to_string(), inst.name.clone())),
            Json(report),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let stored = cluster.get_instance(&inst.key()).await.unwrap();
        assert_eq!(stored.status, InstanceStatus::MarkedForDeletion);
        assert!(stored.owner.is_none());

        let row = state.store.get_entity("default", &inst.name).unwrap();
        assert_eq!(row.status.as_deref(), Some(STATUS_MARKED_FOR_DELETION));
        assert_eq!(state.store.query_marked_for_deletion_zero_sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_report_rejects_unknown_status() {
        let (state, cluster) = test_state();
        let inst = seed_instance(&cluster).await;
        let report = StatusReport {
            status: Some("Sleeping".to_string()),
            ..StatusReport::default()
        };
        let resp = report_status(
            State(state),
            Path(("default".to_string(), inst.name)),
            Json(report),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_report_for_unknown_instance_is_404() {
        let (state, _) = test_state();
        let resp = report_status(
            State(state),
            Path(("default".to_string(), "ghost".to_string())),
            Json(StatusReport::default()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
