//! Release archive ingestion
//!
//! An archive is a gzip-compressed tar. It must carry every required marker
//! at its root, must not carry a forbidden one, and the metadata marker's
//! `KEY=VALUE` lines must provide `BRANCH` and `TAG`.

pub mod envfile;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::FleetError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::Artifact;
use crate::store::Store;
use crate::utils::sha256_file;

#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    /// Root of `YYYY/MM/<timestamp>_<name>` archive storage
    pub storage_dir: PathBuf,
    pub required_markers: Vec<String>,
    pub forbidden_markers: Vec<String>,
    /// Required marker holding release metadata
    pub metadata_marker: String,
}

impl Default for ArtifactOptions {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("/var/lib/fleetops/artifacts"),
            required_markers: vec!["version.env".to_string(), "jetalon.env".to_string()],
            forbidden_markers: vec!["stand.env".to_string()],
            metadata_marker: "version.env".to_string(),
        }
    }
}

/// What an archive says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub version: String,
    pub tag: String,
    pub params: BTreeMap<String, String>,
}

fn invalid(message: impl Into<String>) -> FleetError {
    FleetError::ArtifactInvalid(message.into())
}

fn normalize_entry(path: &Path) -> String {
    let text = path.to_string_lossy();
    let mut name = text.as_ref();
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.trim_end_matches('/').to_string()
}

/// Validate the archive at `path` and read its metadata. Blocking.
pub fn inspect_archive(path: &Path, options: &ArtifactOptions) -> Result<ArchiveMetadata, FleetError> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut seen = BTreeSet::new();
    let mut metadata = None;

    let entries = archive
        .entries()
        .map_err(|e| invalid(format!("not a gzip tar archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(format!("corrupt archive: {e}")))?;
        let name = normalize_entry(&entry.path().map_err(|e| invalid(e.to_string()))?);

        if options.forbidden_markers.contains(&name) {
            return Err(invalid(format!("archive must not contain {name}")));
        }
        if !options.required_markers.contains(&name) {
            continue;
        }
        if name == options.metadata_marker {
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .map_err(|e| invalid(format!("unreadable {name}: {e}")))?;
            metadata = Some(contents);
        }
        seen.insert(name);
    }

    let missing: Vec<&str> = options
        .required_markers
        .iter()
        .filter(|m| !seen.contains(*m))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!("archive is missing {}", missing.join(", "))));
    }

    let contents = metadata.ok_or_else(|| invalid(format!("{} not found", options.metadata_marker)))?;
    let params = envfile::parse_env(&contents)
        .map_err(|e| invalid(format!("{}: {e}", options.metadata_marker)))?;

    let field = |key: &str| {
        params
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| invalid(format!("{} has no {key}", options.metadata_marker)))
    };
    Ok(ArchiveMetadata {
        version: field("BRANCH")?,
        tag: field("TAG")?,
        params,
    })
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "artifact.tar.gz".to_string()
    } else {
        cleaned
    }
}

/// Copy `source` into storage, validate it and record it. Nothing is kept on
/// failure.
pub async fn ingest(
    store: &Store,
    options: &ArtifactOptions,
    source: &Path,
    file_name: Option<String>,
) -> Result<Artifact, FleetError> {
    let file_name = file_name
        .or_else(|| source.file_name().map(|n| n.to_string_lossy().into_owned()))
        .map(|n| sanitize_file_name(&n))
        .unwrap_or_else(|| "artifact.tar.gz".to_string());

    let now = Utc::now();
    let stored = File::new(
        options
            .storage_dir
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(format!("{}_{}", now.format("%Y%m%d%H%M%S%3f"), file_name)),
    );
    stored.copy_from(source).await?;

    let path = stored.path().to_path_buf();
    let inspect_options = options.clone();
    let inspected = tokio::task::spawn_blocking(move || {
        let digest = sha256_file(&path)?;
        let metadata = inspect_archive(&path, &inspect_options)?;
        Ok::<_, FleetError>((digest, metadata))
    })
    .await
    .map_err(FleetError::from)
    .and_then(|r| r);

    let (sha256, metadata) = match inspected {
        Ok(result) => result,
        Err(e) => {
            warn!("Rejected artifact {}: {}", file_name, e);
            if let Err(cleanup) = remove_stored(options, &stored).await {
                warn!("Failed to remove rejected artifact {}: {}", stored.path().display(), cleanup);
            }
            return Err(e);
        }
    };

    let artifact = Artifact {
        id: Uuid::new_v4(),
        file: stored.path().to_path_buf(),
        file_name,
        version: metadata.version,
        tag: metadata.tag,
        sha256,
        created_at: now,
    };
    info!(
        artifact = %artifact.id,
        version = %artifact.version,
        tag = %artifact.tag,
        "Ingested artifact {}",
        artifact.file_name
    );
    store.artifacts.insert(artifact.clone());
    Ok(artifact)
}

/// Delete a stored archive along with month and year directories it leaves empty
async fn remove_stored(options: &ArtifactOptions, file: &File) -> Result<(), FleetError> {
    file.delete().await?;
    if let Some(parent) = file.path().parent() {
        Dir::new(&options.storage_dir).prune_empty_from(parent).await?;
    }
    Ok(())
}

/// Forget an artifact and remove its file. Refused while an unfinished
/// rollout still needs it.
pub async fn delete(
    store: &Store,
    options: &ArtifactOptions,
    id: &Uuid,
) -> Result<Artifact, FleetError> {
    let in_use = !store
        .staged_rollouts
        .find(|r| &r.artifact == id && !r.status.is_terminal())
        .is_empty()
        || !store
            .host_rollouts
            .find(|r| &r.artifact == id && !r.status.is_terminal())
            .is_empty();
    if in_use {
        return Err(FleetError::ValidationError(format!(
            "artifact {id} is used by a running rollout"
        )));
    }

    let artifact = store
        .artifacts
        .remove(id)
        .ok_or_else(|| FleetError::NotFound(format!("artifact {id}")))?;
    remove_stored(options, &File::new(&artifact.file)).await?;
    info!(artifact = %id, "Deleted artifact {}", artifact.file_name);
    Ok(artifact)
}
