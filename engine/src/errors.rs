//! Error types for the fleetops engine

use thiserror::Error;

/// Main error type for the fleetops engine
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("No {kind} credential for host {host}")]
    CredentialMissing { host: String, kind: String },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Connection error: {0}")]
    ConnectError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Partial failure: {failed} of {total} targets failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Invalid artifact: {0}")]
    ArtifactInvalid(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FleetError {
    fn from(err: tokio::task::JoinError) -> Self {
        FleetError::Internal(format!("task failed: {err}"))
    }
}
