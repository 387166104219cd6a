//! Router-level tests: requests go through the full axum stack.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleetgrid_api::{ApiState, CollectionDefaults, build_router};
use fleetgrid_cluster::{ClusterClient, Collection, CollectionSpec, InMemoryCluster, Instance};
use fleetgrid_state::{GameServerEntity, STATUS_MARKED_FOR_DELETION, StateStore};
use serde_json::{Value, json};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    cluster: Arc<InMemoryCluster>,
    store: StateStore,
}

fn app() -> TestApp {
    let cluster = Arc::new(InMemoryCluster::new());
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(ApiState {
        cluster: cluster.clone(),
        store: store.clone(),
        defaults: CollectionDefaults {
            image: "docker.io/dgkanatsios/docker_openarena_k8s:0.0.1".to_string(),
            start_map: "dm4ish".to_string(),
        },
    });
    TestApp {
        router,
        cluster,
        store,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn healthz_is_ok() {
    let app = app();
    let (status, body) = send(&app.router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn submit_get_and_list_collection() {
    let app = app();

    let (status, body) = send(
        &app.router,
        post("/api/v1/collections", json!({ "name": "arena", "replicas": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["namespace"], "default");
    assert_eq!(
        body["data"]["spec"]["image"],
        "docker.io/dgkanatsios/docker_openarena_k8s:0.0.1"
    );
    assert_eq!(body["data"]["spec"]["startMap"], "dm4ish");

    let (status, body) = send(&app.router, get("/api/v1/collections/default/arena")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["spec"]["replicas"], 5);

    let (status, body) = send(&app.router, get("/api/v1/collections")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_submission_conflicts() {
    let app = app();
    let req = json!({ "namespace": "games", "name": "arena", "replicas": 1, "image": "custom:1" });

    let (status, body) = send(&app.router, post("/api/v1/collections", req.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["spec"]["image"], "custom:1");

    let (status, body) = send(&app.router, post("/api/v1/collections", req)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn missing_collection_is_404() {
    let app = app();
    let (status, _) = send(&app.router, get("/api/v1/collections/default/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        post("/api/v1/collections/default/nope/scale", json!({ "replicas": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scale_updates_replicas() {
    let app = app();
    send(
        &app.router,
        post("/api/v1/collections", json!({ "name": "arena", "replicas": 5 })),
    )
    .await;

    let (status, body) = send(
        &app.router,
        post("/api/v1/collections/default/arena/scale", json!({ "replicas": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["spec"]["replicas"], 2);
}

#[tokio::test]
async fn instances_filter_by_owner() {
    let app = app();
    let spec = CollectionSpec {
        replicas: 1,
        image: "openarena".to_string(),
        start_map: "dm4ish".to_string(),
    };
    let a = Collection::new("default", "a", spec.clone());
    let b = Collection::new("default", "b", spec);
    app.cluster
        .create_instance(Instance::for_collection(&a, "a-00001", 20000))
        .await
        .unwrap();
    app.cluster
        .create_instance(Instance::for_collection(&b, "b-00001", 20001))
        .await
        .unwrap();

    let (status, body) = send(&app.router, get("/api/v1/instances")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app.router, get("/api/v1/instances?collection=default/a")).await;
    assert_eq!(status, StatusCode::OK);
    let owned = body["data"].as_array().unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0]["name"], "a-00001");

    let (status, _) = send(&app.router, get("/api/v1/instances?collection=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_reports_feed_entity_queries() {
    let app = app();
    let col = Collection::new(
        "default",
        "arena",
        CollectionSpec {
            replicas: 2,
            image: "openarena".to_string(),
            start_map: "dm4ish".to_string(),
        },
    );
    for (name, port) in [("arena-aaaaa", 20000), ("arena-bbbbb", 20001)] {
        app.cluster
            .create_instance(Instance::for_collection(&col, name, port))
            .await
            .unwrap();
    }

    let (status, body) = send(
        &app.router,
        post(
            "/api/v1/instances/default/arena-aaaaa/status",
            json!({ "status": "Running", "activeSessions": 2, "nodeName": "node-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "Running");
    assert_eq!(body["data"]["nodeName"], "node-1");

    let (_, body) = send(&app.router, get("/api/v1/entities/running")).await;
    let running = body["data"].as_array().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0]["name"], "arena-aaaaa");
    assert_eq!(running[0]["activeSessions"], "2");

    // A drained, unlinked row shows up in the drain set.
    app.store
        .upsert_entity(
            &GameServerEntity::new("default", "arena-bbbbb")
                .with_port(20001)
                .with_status(STATUS_MARKED_FOR_DELETION)
                .with_active_sessions(0),
        )
        .unwrap();
    let (_, body) = send(&app.router, get("/api/v1/entities/drained")).await;
    let drained = body["data"].as_array().unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0]["name"], "arena-bbbbb");
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let app = app();
    let (status, _) = send(
        &app.router,
        post("/api/v1/collections", json!({ "name": "arena" })),
    )
    .await;
    assert!(status.is_client_error());
}
