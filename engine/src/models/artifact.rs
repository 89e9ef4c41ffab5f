//! Uploaded release archives

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A validated release archive kept on the engine host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,

    /// Stored archive
    pub file: PathBuf,

    /// Name the archive was uploaded under
    pub file_name: String,

    /// Release version (BRANCH)
    pub version: String,

    /// Release tag (TAG)
    pub tag: String,

    /// Hex SHA-256 of the archive
    pub sha256: String,

    pub created_at: DateTime<Utc>,
}
