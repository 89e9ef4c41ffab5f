//! Durable record store
//!
//! Records live in memory behind per-row locks and are snapshotted to a JSON
//! file. Operations, instances, artifacts and both rollout kinds each get
//! their own table.

pub mod table;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::models::{
    Artifact, HostRollout, Instance, Operation, OperationStatus, StagedRollout,
};

pub use table::{Record, Table};

impl Record for Operation {
    fn id(&self) -> Uuid {
        self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for Instance {
    fn id(&self) -> Uuid {
        self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for Artifact {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Record for StagedRollout {
    fn id(&self) -> Uuid {
        self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for HostRollout {
    fn id(&self) -> Uuid {
        self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Serialized form of the whole store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub staged_rollouts: Vec<StagedRollout>,
    #[serde(default)]
    pub host_rollouts: Vec<HostRollout>,
}

/// All record tables
pub struct Store {
    pub operations: Table<Operation>,
    pub instances: Table<Instance>,
    pub artifacts: Table<Artifact>,
    pub staged_rollouts: Table<StagedRollout>,
    pub host_rollouts: Table<HostRollout>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            operations: Table::new("operation"),
            instances: Table::new("instance"),
            artifacts: Table::new("artifact"),
            staged_rollouts: Table::new("staged rollout"),
            host_rollouts: Table::new("host rollout"),
        }
    }

    /// Append a line to an operation's log under its row lock
    pub fn log_operation(
        &self,
        id: &Uuid,
        host: Option<Uuid>,
        message: impl Into<String>,
    ) -> Result<(), FleetError> {
        let message = message.into();
        self.operations.update(id, |op| {
            op.log.append(host, message);
        })
    }

    /// Append a line to a host rollout's log under its row lock
    pub fn log_host_rollout(
        &self,
        id: &Uuid,
        host: Option<Uuid>,
        message: impl Into<String>,
    ) -> Result<(), FleetError> {
        let message = message.into();
        self.host_rollouts.update(id, |r| {
            r.log.append(host, message);
        })
    }

    /// Clear the parent of every operation issued by `parent`
    pub fn detach_operations(&self, parent: Uuid) -> usize {
        self.operations
            .update_where(|op| op.parent == Some(parent), |op| op.parent = None)
    }

    /// Remove every instance that lives on `host`
    pub fn remove_instances_of_host(&self, host: Uuid) -> Vec<Instance> {
        self.instances
            .find(|i| i.host == host)
            .into_iter()
            .filter_map(|i| self.instances.remove(&i.id))
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            operations: self.operations.list(),
            instances: self.instances.list(),
            artifacts: self.artifacts.list(),
            staged_rollouts: self.staged_rollouts.list(),
            host_rollouts: self.host_rollouts.list(),
        }
    }

    /// Rebuild a store from a snapshot.
    ///
    /// Work that was in flight when the snapshot was taken cannot resume, so
    /// every non-terminal record is moved to `error`.
    pub fn restore(snapshot: Snapshot) -> Self {
        let store = Self::new();

        for mut op in snapshot.operations {
            if !op.status.is_terminal() {
                op.status = OperationStatus::Error;
                op.log.append(None, "Interrupted by engine restart.");
            }
            store.operations.insert(op);
        }
        for instance in snapshot.instances {
            store.instances.insert(instance);
        }
        for artifact in snapshot.artifacts {
            store.artifacts.insert(artifact);
        }
        for mut rollout in snapshot.staged_rollouts {
            if !rollout.status.is_terminal() {
                rollout.status = OperationStatus::Error;
                rollout.pending.clear();
                rollout.log.append(None, "Interrupted by engine restart.");
            }
            store.staged_rollouts.insert(rollout);
        }
        for mut rollout in snapshot.host_rollouts {
            if !rollout.status.is_terminal() {
                rollout.status = OperationStatus::Error;
                rollout.log.append(None, "Interrupted by engine restart.");
            }
            store.host_rollouts.insert(rollout);
        }

        store
    }

    /// Write a snapshot to `file`
    pub async fn save(&self, file: &File) -> Result<(), FleetError> {
        file.write_json(&self.snapshot()).await
    }

    /// Load a store from `file`, or start empty when the file does not exist
    pub async fn load(file: &File) -> Result<Self, FleetError> {
        if !file.exists().await {
            info!("No state file at {}, starting empty", file.path().display());
            return Ok(Self::new());
        }

        let snapshot: Snapshot = file.read_json().await.map_err(|e| {
            warn!("Failed to read state file {}: {}", file.path().display(), e);
            e
        })?;

        info!(
            operations = snapshot.operations.len(),
            instances = snapshot.instances.len(),
            artifacts = snapshot.artifacts.len(),
            "Restored state from {}",
            file.path().display()
        );
        Ok(Self::restore(snapshot))
    }
}
