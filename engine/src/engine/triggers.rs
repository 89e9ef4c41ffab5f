//! Events the engine reacts to
//!
//! Each trigger validates its input, records what it creates and hands the
//! long-running part to the task queue.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifact::{self, envfile::parse_env_lossy};
use crate::engine::Engine;
use crate::errors::FleetError;
use crate::models::{
    Artifact, ExecProtocol, FileSource, HostRollout, Instance, Operation, OperationKind, OsKind,
    StagedRollout,
};
use crate::ops::poll::{await_terminal, PollOutcome};
use crate::ops::scheduler::submit;
use crate::rollout::{commands, host, staged};

/// Absolute instance directory
static INSTANCE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/[a-zA-Z0-9._\-/]+)$").expect("valid regex"));

pub fn is_valid_instance_path(path: &str) -> bool {
    INSTANCE_PATH.is_match(path)
        && !path.trim_end_matches('/').is_empty()
        && !path.split('/').any(|part| part == "..")
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// Validate and dispatch a new operation
pub async fn create_operation(
    engine: &Engine,
    kind: OperationKind,
    hosts: Vec<Uuid>,
) -> Result<Uuid, FleetError> {
    let hosts = dedup(hosts);
    if hosts.is_empty() {
        return Err(FleetError::ValidationError("no target hosts".to_string()));
    }

    match &kind {
        OperationKind::ExecuteCommand { commands, .. } => {
            if commands.is_empty() || commands.iter().any(|c| c.trim().is_empty()) {
                return Err(FleetError::ValidationError(
                    "commands must be a non-empty list of non-empty strings".to_string(),
                ));
            }
        }
        OperationKind::SendFile {
            source,
            destination,
            ..
        } => {
            if destination.trim().is_empty() {
                return Err(FleetError::ValidationError("destination is empty".to_string()));
            }
            match source {
                FileSource::Local { path } => {
                    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                        return Err(FleetError::ValidationError(format!(
                            "source file {} does not exist",
                            path.display()
                        )));
                    }
                }
                FileSource::Artifact { id } => {
                    engine.store.artifacts.require(id)?;
                }
            }
        }
    }

    for id in &hosts {
        if engine.inventory.host(id).await.is_none() {
            return Err(FleetError::NotFound(format!("host {id}")));
        }
    }

    let label = kind.label();
    let op_id = submit(engine, Operation::new(kind, hosts))?;
    info!(operation = %op_id, "Created {} operation", label);
    Ok(op_id)
}

/// Register an instance and introspect it in the background
pub async fn register_instance(
    engine: &Engine,
    host_id: Uuid,
    path: String,
) -> Result<Instance, FleetError> {
    if !is_valid_instance_path(&path) {
        return Err(FleetError::ValidationError(format!(
            "invalid instance path {path:?}"
        )));
    }
    let host = engine
        .inventory
        .host(&host_id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("host {host_id}")))?;

    let normalized = path.trim_end_matches('/').to_string();
    if !engine
        .store
        .instances
        .find(|i| i.host == host_id && i.path == normalized)
        .is_empty()
    {
        return Err(FleetError::ValidationError(format!(
            "{} already has an instance at {normalized}",
            host.name
        )));
    }

    let mut instance = Instance::new(host_id, normalized);
    if host.os == OsKind::Windows {
        instance.invalid_reason = Some(format!(
            "{} is a Windows host; instances are only supported on Linux hosts",
            host.name
        ));
    }
    let instance_id = engine.store.instances.insert(instance.clone());
    info!(instance = %instance_id, host = %host.name, "Registered instance at {}", instance.path);

    if host.os == OsKind::Windows {
        warn!(instance = %instance_id, "Instances on Windows hosts are not supported, marking invalid");
        return Ok(instance);
    }

    let introspection = Operation::new(
        OperationKind::ExecuteCommand {
            commands: commands::introspect(&instance.path),
            protocol: ExecProtocol::Ssh,
            elevate: false,
        },
        vec![host_id],
    )
    .with_parent(instance_id);
    let op_id = submit(engine, introspection)?;

    let task_engine = engine.clone();
    engine
        .queue
        .schedule_after(engine.options.rollout.introspection_delay, async move {
            apply_introspection(&task_engine, instance_id, op_id).await;
        });
    Ok(instance)
}

async fn apply_introspection(engine: &Engine, instance_id: Uuid, op_id: Uuid) {
    let outcome = await_terminal(&engine.store, op_id, &engine.options.poll).await;
    let params = match (outcome, engine.store.operations.get(&op_id)) {
        (PollOutcome::Completed, Some(op)) => {
            let host = op.hosts.first().copied().unwrap_or_default();
            parse_env_lossy(&op.stdout_for(host))
        }
        _ => Default::default(),
    };

    match engine.store.instances.update(&instance_id, |i| {
        let valid = i.apply_params(&params);
        if !outcome.is_completed() {
            i.invalid_reason = Some(format!(
                "introspection operation {op_id} {}",
                match outcome {
                    PollOutcome::TimedOut => "did not finish in time",
                    _ => "failed",
                }
            ));
        }
        valid
    }) {
        Ok(true) => info!(instance = %instance_id, "Introspection succeeded"),
        Ok(false) => warn!(
            instance = %instance_id,
            operation = %op_id,
            "Introspection {:?}, instance marked invalid",
            outcome
        ),
        Err(e) => warn!(instance = %instance_id, "Instance gone before introspection finished: {}", e),
    }
}

pub async fn ingest_artifact(
    engine: &Engine,
    path: PathBuf,
    file_name: Option<String>,
) -> Result<Artifact, FleetError> {
    artifact::ingest(&engine.store, &engine.options.artifact, &path, file_name).await
}

pub async fn delete_artifact(engine: &Engine, id: Uuid) -> Result<Artifact, FleetError> {
    artifact::delete(&engine.store, &engine.options.artifact, &id).await
}

fn check_rollout_targets(
    engine: &Engine,
    artifact: &Uuid,
    instances: &[Uuid],
) -> Result<(), FleetError> {
    if instances.is_empty() {
        return Err(FleetError::ValidationError("no target instances".to_string()));
    }
    engine.store.artifacts.require(artifact)?;
    for id in instances {
        engine.store.instances.require(id)?;
    }
    Ok(())
}

/// Record a staged rollout and start its pipeline
pub fn create_staged_rollout(
    engine: &Engine,
    artifact: Uuid,
    instances: Vec<Uuid>,
) -> Result<Uuid, FleetError> {
    let instances = dedup(instances);
    check_rollout_targets(engine, &artifact, &instances)?;

    let rollout_id = engine
        .store
        .staged_rollouts
        .insert(StagedRollout::new(artifact, instances));
    info!(rollout = %rollout_id, "Created staged rollout");

    let task_engine = engine.clone();
    engine.queue.schedule_now(async move {
        if let Err(e) = staged::start(&task_engine, rollout_id) {
            error!(rollout = %rollout_id, "Staged rollout did not start: {}", e);
        }
    });
    Ok(rollout_id)
}

/// Record a host rollout and start its host workflows
pub fn create_host_rollout(
    engine: &Engine,
    artifact: Uuid,
    instances: Vec<Uuid>,
    backup: bool,
) -> Result<Uuid, FleetError> {
    let instances = dedup(instances);
    check_rollout_targets(engine, &artifact, &instances)?;

    let rollout_id = engine
        .store
        .host_rollouts
        .insert(HostRollout::new(artifact, instances, backup));
    info!(rollout = %rollout_id, "Created host rollout");

    let task_engine = engine.clone();
    engine.queue.schedule_now(async move {
        if let Err(e) = host::start(&task_engine, rollout_id) {
            error!(rollout = %rollout_id, "Host rollout did not start: {}", e);
        }
    });
    Ok(rollout_id)
}

/// Delete a staged rollout; its operations are kept and detached
pub fn delete_staged_rollout(engine: &Engine, id: Uuid) -> Result<StagedRollout, FleetError> {
    let rollout = engine
        .store
        .staged_rollouts
        .remove(&id)
        .ok_or_else(|| FleetError::NotFound(format!("staged rollout {id}")))?;
    let detached = engine.store.detach_operations(id);
    info!(rollout = %id, detached, "Deleted staged rollout");
    Ok(rollout)
}

/// Delete a finished host rollout; its operations are kept and detached
pub fn delete_host_rollout(engine: &Engine, id: Uuid) -> Result<HostRollout, FleetError> {
    let rollout = engine.store.host_rollouts.require(&id)?;
    if !rollout.status.is_terminal() {
        return Err(FleetError::ValidationError(format!(
            "host rollout {id} is still running"
        )));
    }
    engine.store.host_rollouts.remove(&id);
    let detached = engine.store.detach_operations(id);
    info!(rollout = %id, detached, "Deleted host rollout");
    Ok(rollout)
}

/// Remove a host and every instance on it
pub async fn delete_host(engine: &Engine, id: Uuid) -> Result<Vec<Instance>, FleetError> {
    let host = engine
        .inventory
        .remove_host(&id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("host {id}")))?;
    let removed = engine.store.remove_instances_of_host(id);
    info!(host = %host.name, instances = removed.len(), "Deleted host");
    Ok(removed)
}
