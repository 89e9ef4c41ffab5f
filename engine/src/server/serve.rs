//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::FleetError;
use crate::server::handlers::{
    create_command_handler, create_file_transfer_handler, create_host_rollout_handler,
    create_staged_rollout_handler, delete_artifact_handler, delete_host_handler,
    delete_host_rollout_handler, delete_staged_rollout_handler, get_artifact_handler,
    get_host_rollout_handler, get_instance_handler, get_operation_handler,
    get_staged_rollout_handler, health_handler, ingest_artifact_handler,
    register_instance_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the trigger/read router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Operations
        .route("/operations/commands", post(create_command_handler))
        .route("/operations/files", post(create_file_transfer_handler))
        .route("/operations/{id}", get(get_operation_handler))
        // Inventory
        .route("/instances", post(register_instance_handler))
        .route("/instances/{id}", get(get_instance_handler))
        .route("/hosts/{id}", delete(delete_host_handler))
        // Artifacts
        .route("/artifacts", post(ingest_artifact_handler))
        .route(
            "/artifacts/{id}",
            get(get_artifact_handler).delete(delete_artifact_handler),
        )
        // Rollouts
        .route("/rollouts/staged", post(create_staged_rollout_handler))
        .route(
            "/rollouts/staged/{id}",
            get(get_staged_rollout_handler).delete(delete_staged_rollout_handler),
        )
        .route("/rollouts/hosts", post(create_host_rollout_handler))
        .route(
            "/rollouts/hosts/{id}",
            get(get_host_rollout_handler).delete(delete_host_rollout_handler),
        )
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), FleetError>>, FleetError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| FleetError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| FleetError::ServerError(e.to_string()))
    });

    Ok(handle)
}
