//! API models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run a list of commands on a set of hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommandRequest {
    /// Commands, executed in order on every host
    pub commands: Vec<String>,

    /// Remote execution protocol: "ssh" or "winrm"
    pub protocol: String,

    /// Run every command with elevated privileges (ssh only)
    #[serde(default)]
    pub elevate: bool,

    /// Target hosts
    pub hosts: Vec<Uuid>,
}

/// Push a file to a set of hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileTransferRequest {
    /// File transfer protocol: "sftp" or "smb"
    pub protocol: String,

    /// Local path on the engine host
    #[serde(default)]
    pub local_path: Option<String>,

    /// Previously ingested artifact, used when `local_path` is absent
    #[serde(default)]
    pub artifact_id: Option<Uuid>,

    /// Destination path on the remote hosts
    pub target_path: String,

    /// Target hosts
    pub hosts: Vec<Uuid>,
}

/// Register a deployed instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInstanceRequest {
    pub host: Uuid,
    pub path: String,
}

/// Ingest an uploaded release archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestArtifactRequest {
    /// Path of the uploaded archive on the engine host
    pub path: String,

    /// Original file name, defaults to the file name of `path`
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Start a rollout of an artifact to a set of instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRolloutRequest {
    pub artifact_id: Uuid,
    pub instances: Vec<Uuid>,

    /// Copy each instance directory aside before updating it (host rollouts only)
    #[serde(default)]
    pub backup: bool,
}

/// Identifier of a newly created record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: Uuid,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Queued, delayed and running engine tasks
    pub tasks_in_flight: usize,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}
