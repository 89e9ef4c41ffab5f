//! HTTP request handlers

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_api::{
    CreateCommandRequest, CreateFileTransferRequest, CreateRolloutRequest, CreatedResponse,
    ErrorResponse, HealthResponse, IngestArtifactRequest, RegisterInstanceRequest,
    VersionResponse,
};
use uuid::Uuid;

use crate::engine::triggers;
use crate::errors::FleetError;
use crate::models::{ExecProtocol, FileProtocol, FileSource, OperationKind};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error returned by handlers, rendered as an [`ErrorResponse`]
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::ValidationError(_)
            | FleetError::ArtifactInvalid(_)
            | FleetError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            FleetError::NotFound(_) => "not_found",
            FleetError::ValidationError(_) => "validation_error",
            FleetError::ArtifactInvalid(_) => "artifact_invalid",
            FleetError::InvalidTransition(_) => "invalid_transition",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.0.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn created(id: Uuid) -> (StatusCode, Json<CreatedResponse>) {
    (StatusCode::CREATED, Json(CreatedResponse { id }))
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fleetops".to_string(),
        version: version.version,
        uptime_secs: state.started_at.elapsed().as_secs(),
        tasks_in_flight: state.engine.queue.in_flight(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================ OPERATIONS ===================================== //

pub async fn create_command_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateCommandRequest>,
) -> ApiResult<impl IntoResponse> {
    let protocol: ExecProtocol = request.protocol.parse()?;
    let kind = OperationKind::ExecuteCommand {
        commands: request.commands,
        protocol,
        elevate: request.elevate,
    };
    let id = triggers::create_operation(&state.engine, kind, request.hosts).await?;
    Ok(created(id))
}

pub async fn create_file_transfer_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateFileTransferRequest>,
) -> ApiResult<impl IntoResponse> {
    let protocol: FileProtocol = request.protocol.parse()?;
    let source = match (request.local_path, request.artifact_id) {
        (Some(path), _) => FileSource::Local {
            path: PathBuf::from(path),
        },
        (None, Some(id)) => FileSource::Artifact { id },
        (None, None) => {
            return Err(FleetError::ValidationError(
                "either local_path or artifact_id is required".to_string(),
            )
            .into())
        }
    };
    let kind = OperationKind::SendFile {
        protocol,
        source,
        destination: request.target_path,
    };
    let id = triggers::create_operation(&state.engine, kind, request.hosts).await?;
    Ok(created(id))
}

pub async fn get_operation_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.store.operations.require(&id)?))
}

// ============================ INSTANCES AND HOSTS ================================ //

pub async fn register_instance_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RegisterInstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    let instance = triggers::register_instance(&state.engine, request.host, request.path).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn get_instance_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.store.instances.require(&id)?))
}

pub async fn delete_host_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    triggers::delete_host(&state.engine, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ================================= ARTIFACTS ===================================== //

pub async fn ingest_artifact_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<IngestArtifactRequest>,
) -> ApiResult<impl IntoResponse> {
    let artifact =
        triggers::ingest_artifact(&state.engine, PathBuf::from(request.path), request.file_name)
            .await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

pub async fn get_artifact_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.store.artifacts.require(&id)?))
}

pub async fn delete_artifact_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    triggers::delete_artifact(&state.engine, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ================================= ROLLOUTS ====================================== //

pub async fn create_staged_rollout_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateRolloutRequest>,
) -> ApiResult<impl IntoResponse> {
    let id =
        triggers::create_staged_rollout(&state.engine, request.artifact_id, request.instances)?;
    Ok(created(id))
}

pub async fn get_staged_rollout_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.store.staged_rollouts.require(&id)?))
}

pub async fn delete_staged_rollout_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    triggers::delete_staged_rollout(&state.engine, id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_host_rollout_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateRolloutRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = triggers::create_host_rollout(
        &state.engine,
        request.artifact_id,
        request.instances,
        request.backup,
    )?;
    Ok(created(id))
}

pub async fn get_host_rollout_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.store.host_rollouts.require(&id)?))
}

pub async fn delete_host_rollout_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    triggers::delete_host_rollout(&state.engine, id)?;
    Ok(StatusCode::NO_CONTENT)
}
