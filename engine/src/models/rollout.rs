//! Rollout records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FleetError;
use crate::models::log::EventLog;
use crate::models::operation::OperationStatus;

/// Step of the staged pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Send the artifact to every instance's host
    Distribute,
    /// Unpack next to the instance and carry over stand configuration
    Prepare,
    /// Pull the release's images
    PullImages,
}

/// Prepares a set of instances for an update, pruning the ones that fail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedRollout {
    pub id: Uuid,
    pub artifact: Uuid,

    /// Instances requested at creation
    pub instances: Vec<Uuid>,

    /// Instances still in the pipeline
    pub active: Vec<Uuid>,

    pub stage: Stage,
    pub status: OperationStatus,

    /// Outstanding operation id -> instance id for the current stage
    pub pending: BTreeMap<Uuid, Uuid>,

    pub log: EventLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagedRollout {
    pub fn new(artifact: Uuid, instances: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            artifact,
            active: Vec::new(),
            instances,
            stage: Stage::Distribute,
            status: OperationStatus::Queued,
            pending: BTreeMap::new(),
            log: EventLog::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: OperationStatus) -> Result<(), FleetError> {
        self.status.advance(next)
    }
}

/// Updates instances host by host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRollout {
    pub id: Uuid,
    pub artifact: Uuid,
    pub instances: Vec<Uuid>,

    /// Copy each instance directory aside before touching it
    #[serde(default)]
    pub backup: bool,

    pub status: OperationStatus,

    /// Outcome of each host workflow
    pub host_results: BTreeMap<Uuid, bool>,

    pub log: EventLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRollout {
    pub fn new(artifact: Uuid, instances: Vec<Uuid>, backup: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            artifact,
            instances,
            backup,
            status: OperationStatus::Queued,
            host_results: BTreeMap::new(),
            log: EventLog::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: OperationStatus) -> Result<(), FleetError> {
        self.status.advance(next)
    }
}
