//! Trigger/read HTTP surface

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use fleet_api::{CreatedResponse, ErrorResponse, HealthResponse};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;

use fleetops::models::OsKind;
use fleetops::server::serve::router;
use fleetops::server::state::ServerState;

use crate::common::Harness;

fn app(harness: &Harness) -> Router {
    router(Arc::new(ServerState::new(harness.engine.clone())))
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::healthy();

    let (status, body) = send(app(&harness), Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = parse(&body);
    assert_eq!(health.status, "healthy");
    assert_eq!(health.service, "fleetops");
}

#[tokio::test]
async fn test_command_operation_round_trip() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/operations/commands",
        Some(json!({"commands": ["uptime"], "protocol": "ssh", "hosts": [host.id]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created: CreatedResponse = parse(&body);
    harness.settle().await;

    let (status, body) = send(
        app(&harness),
        Method::GET,
        &format!("/operations/{}", created.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let op: Value = parse(&body);
    assert_eq!(op["status"], "completed");
    assert_eq!(op["hosts"][0], json!(host.id));
}

#[tokio::test]
async fn test_unknown_protocol_is_bad_request() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/operations/commands",
        Some(json!({"commands": ["uptime"], "protocol": "telnet", "hosts": [host.id]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: ErrorResponse = parse(&body);
    assert_eq!(error.error, "validation_error");
    assert!(error.message.contains("telnet"));
    assert!(harness.engine.store.operations.is_empty());
}

#[tokio::test]
async fn test_file_transfer_needs_a_source() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;

    let (status, _) = send(
        app(&harness),
        Method::POST,
        "/operations/files",
        Some(json!({"protocol": "sftp", "target_path": "/tmp/x", "hosts": [host.id]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_records_are_not_found() {
    let harness = Harness::healthy();
    let id = uuid::Uuid::new_v4();

    for uri in [
        format!("/operations/{id}"),
        format!("/instances/{id}"),
        format!("/artifacts/{id}"),
        format!("/rollouts/staged/{id}"),
        format!("/rollouts/hosts/{id}"),
    ] {
        let (status, body) = send(app(&harness), Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        let error: ErrorResponse = parse(&body);
        assert_eq!(error.error, "not_found");
    }

    let (status, _) = send(app(&harness), Method::DELETE, &format!("/hosts/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_staged_rollout_lifecycle() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/rollouts/staged",
        Some(json!({"artifact_id": artifact.id, "instances": [instance.id]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created: CreatedResponse = parse(&body);
    harness.settle().await;

    let uri = format!("/rollouts/staged/{}", created.id);
    let (status, body) = send(app(&harness), Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let rollout: Value = parse(&body);
    assert_eq!(rollout["status"], "completed");
    assert_eq!(rollout["stage"], "pull_images");

    let (status, _) = send(app(&harness), Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(app(&harness), Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_archive_is_rejected() {
    let harness = Harness::healthy();
    let path = harness.dir.path().join("broken.tar.gz");
    std::fs::write(&path, "not an archive").unwrap();

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/artifacts",
        Some(json!({"path": path})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: ErrorResponse = parse(&body);
    assert_eq!(error.error, "artifact_invalid");
}

#[tokio::test]
async fn test_instance_shows_why_it_is_invalid() {
    let harness = Harness::healthy();
    let host = harness.add_bare_host("win", OsKind::Windows).await;

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/instances",
        Some(json!({"host": host.id, "path": "/opt/app"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let registered: Value = parse(&body);
    harness.settle().await;

    let uri = format!("/instances/{}", registered["id"].as_str().unwrap());
    let (status, body) = send(app(&harness), Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let instance: Value = parse(&body);
    assert_eq!(instance["is_valid"], false);
    assert!(instance["invalid_reason"]
        .as_str()
        .unwrap()
        .contains("Windows host"));
}
