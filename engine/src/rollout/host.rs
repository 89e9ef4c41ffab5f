//! Per-host update orchestrator
//!
//! Instances are grouped by host and every host runs its own sequential
//! workflow: free-space check, archive transfer, then one update per
//! instance with health probes on both sides. A failing step stops that
//! host only; the rollout completes when every host workflow succeeded.

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::FleetError;
use crate::health::{health_url, wait_healthy};
use crate::models::{
    Artifact, ExecProtocol, FileProtocol, FileSource, Host, Instance, Operation, OperationKind,
    OperationStatus,
};
use crate::ops::poll::{await_terminal, PollOutcome};
use crate::ops::scheduler::{aggregate, submit};
use crate::rollout::commands;

/// Group instances by host, keeping the order in which hosts first appear
pub fn group_by_host(instances: Vec<Instance>) -> Vec<(Uuid, Vec<Instance>)> {
    let mut groups: Vec<(Uuid, Vec<Instance>)> = Vec::new();
    for instance in instances {
        match groups.iter_mut().find(|(host, _)| *host == instance.host) {
            Some((_, members)) => members.push(instance),
            None => groups.push((instance.host, vec![instance])),
        }
    }
    groups
}

/// Launch one workflow per host and join them into the rollout status
pub fn start(engine: &Engine, rollout_id: Uuid) -> Result<(), FleetError> {
    let rollout = engine.store.host_rollouts.require(&rollout_id)?;
    let artifact = match engine.store.artifacts.require(&rollout.artifact) {
        Ok(artifact) => artifact,
        Err(e) => {
            fail(engine, rollout_id, format!("Cannot start: {e}"));
            return Err(e);
        }
    };

    let instances = engine.store.instances.filter(&rollout.instances);
    let groups = group_by_host(instances);
    if groups.is_empty() {
        fail(engine, rollout_id, "No instances to update".to_string());
        return Ok(());
    }

    let instance_count: usize = groups.iter().map(|(_, members)| members.len()).sum();
    engine.store.host_rollouts.update(&rollout_id, |r| {
        r.log.append(
            None,
            format!(
                "Updating {} instance(s) on {} host(s) to {}/{}",
                instance_count,
                groups.len(),
                artifact.version,
                artifact.tag
            ),
        );
        r.advance(OperationStatus::Running)
    })??;
    info!(rollout = %rollout_id, hosts = groups.len(), "Host rollout started");

    let hosts: Vec<Uuid> = groups.iter().map(|(host, _)| *host).collect();
    let tasks: Vec<_> = groups
        .into_iter()
        .map(|(host, members)| {
            let engine = engine.clone();
            let artifact = artifact.clone();
            async move { run_host(&engine, rollout_id, &artifact, host, members).await }
        })
        .collect();

    let joiner = engine.clone();
    engine.queue.group_then_join(tasks, move |results| async move {
        finish(&joiner, rollout_id, &hosts, results);
    });
    Ok(())
}

fn finish(engine: &Engine, rollout_id: Uuid, hosts: &[Uuid], results: Vec<Option<bool>>) {
    let outcomes: Vec<(Uuid, bool)> = hosts
        .iter()
        .zip(results)
        .map(|(host, result)| {
            let ok = result.unwrap_or_else(|| {
                warn!(rollout = %rollout_id, host = %host, "Host workflow aborted");
                note(engine, rollout_id, *host, "Host workflow aborted unexpectedly".to_string());
                false
            });
            (*host, ok)
        })
        .collect();
    let flags: Vec<bool> = outcomes.iter().map(|(_, ok)| *ok).collect();
    let status = aggregate(&flags);
    let failed = flags.iter().filter(|ok| !**ok).count();

    let summary = if failed == 0 {
        format!("All {} host(s) updated", flags.len())
    } else {
        format!("{failed} of {} host(s) failed", flags.len())
    };
    let result = engine.store.host_rollouts.update(&rollout_id, |r| {
        r.host_results.extend(outcomes.iter().copied());
        r.log.append(None, summary.clone());
        r.advance(status)
    });
    match result {
        Ok(Ok(())) => info!(rollout = %rollout_id, "{}", summary),
        Ok(Err(e)) | Err(e) => error!(rollout = %rollout_id, "Could not finish rollout: {}", e),
    }
}

fn fail(engine: &Engine, rollout_id: Uuid, message: String) {
    error!(rollout = %rollout_id, "{}", message);
    let result = engine.store.host_rollouts.update(&rollout_id, |r| {
        r.log.append(None, message);
        if !r.status.is_terminal() {
            let _ = r.advance(OperationStatus::Error);
        }
    });
    if let Err(e) = result {
        debug!(rollout = %rollout_id, "Could not record failure: {}", e);
    }
}

/// Append to the rollout log, tolerating a rollout deleted mid-run
fn note(engine: &Engine, rollout_id: Uuid, host: Uuid, message: String) {
    if let Err(e) = engine
        .store
        .log_host_rollout(&rollout_id, Some(host), message)
    {
        debug!(rollout = %rollout_id, "Could not append to rollout log: {}", e);
    }
}

async fn run_host(
    engine: &Engine,
    rollout_id: Uuid,
    artifact: &Artifact,
    host_id: Uuid,
    instances: Vec<Instance>,
) -> bool {
    match host_workflow(engine, rollout_id, artifact, host_id, instances).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(rollout = %rollout_id, host = %host_id, "Host workflow failed: {}", e);
            note(engine, rollout_id, host_id, format!("Host workflow failed: {e}"));
            false
        }
    }
}

/// Issue an operation for this rollout on one host and wait for it
async fn run_operation(
    engine: &Engine,
    rollout_id: Uuid,
    host_id: Uuid,
    kind: OperationKind,
) -> Result<(Uuid, PollOutcome), FleetError> {
    let operation = Operation::new(kind, vec![host_id]).with_parent(rollout_id);
    let op_id = submit(engine, operation)?;
    let outcome = await_terminal(&engine.store, op_id, &engine.options.poll).await;
    Ok((op_id, outcome))
}

fn commands_kind(engine: &Engine, commands: Vec<String>) -> OperationKind {
    OperationKind::ExecuteCommand {
        commands,
        protocol: ExecProtocol::Ssh,
        elevate: engine.options.rollout.elevate,
    }
}

/// Why operation `op_id` did not complete on `host`, as a `": reason"`
/// suffix: the last line logged for the host, else its stderr
fn failure_reason(engine: &Engine, op_id: Uuid, host: Uuid) -> String {
    let Some(op) = engine.store.operations.get(&op_id) else {
        return String::new();
    };
    if let Some(entry) = op.log.for_host(host).last() {
        return format!(": {}", entry.message);
    }
    match op.stderr_for(host).trim() {
        "" => String::new(),
        stderr => format!(": {stderr}"),
    }
}

fn describe(outcome: PollOutcome) -> &'static str {
    match outcome {
        PollOutcome::Completed => "completed",
        PollOutcome::Failed => "failed",
        PollOutcome::TimedOut => "timed out",
    }
}

async fn host_workflow(
    engine: &Engine,
    rollout_id: Uuid,
    artifact: &Artifact,
    host_id: Uuid,
    instances: Vec<Instance>,
) -> Result<bool, FleetError> {
    let options = &engine.options.rollout;
    let host = engine
        .inventory
        .host(&host_id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("host {host_id}")))?;

    if !check_free_space(engine, rollout_id, &host).await? {
        return Ok(false);
    }

    let transfer = OperationKind::SendFile {
        protocol: FileProtocol::Sftp,
        source: FileSource::Artifact { id: artifact.id },
        destination: options.remote_artifact_path.clone(),
    };
    let (op_id, outcome) = run_operation(engine, rollout_id, host_id, transfer).await?;
    if !outcome.is_completed() {
        note(
            engine,
            rollout_id,
            host_id,
            format!(
                "Transfer of {} to {} {} (operation {op_id}){}",
                artifact.file_name,
                host.name,
                describe(outcome),
                failure_reason(engine, op_id, host_id)
            ),
        );
        return Ok(false);
    }
    note(
        engine,
        rollout_id,
        host_id,
        format!("Transferred {} to {}", artifact.file_name, host.name),
    );

    for listed in instances {
        // state may have moved on since the rollout was created
        let Some(instance) = engine.store.instances.get(&listed.id) else {
            note(engine, rollout_id, host_id, format!("Skipped instance {}: no longer registered", listed.id));
            continue;
        };
        if !update_instance(engine, rollout_id, artifact, &host, &instance).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn check_free_space(
    engine: &Engine,
    rollout_id: Uuid,
    host: &Host,
) -> Result<bool, FleetError> {
    let options = &engine.options.rollout;
    let probe = commands_kind(engine, vec![commands::free_space(&options.remote_artifact_path)]);
    let (op_id, outcome) = run_operation(engine, rollout_id, host.id, probe).await?;
    if !outcome.is_completed() {
        note(
            engine,
            rollout_id,
            host.id,
            format!(
                "Free space check on {} {} (operation {op_id}){}",
                host.name,
                describe(outcome),
                failure_reason(engine, op_id, host.id)
            ),
        );
        return Ok(false);
    }

    let stdout = engine
        .store
        .operations
        .get(&op_id)
        .map(|op| op.stdout_for(host.id))
        .unwrap_or_default();
    match commands::parse_free_space(&stdout) {
        None => {
            note(
                engine,
                rollout_id,
                host.id,
                format!("Could not read free space on {} from {:?}", host.name, stdout.trim()),
            );
            Ok(false)
        }
        Some(free) if free < options.min_free_space_kb => {
            note(
                engine,
                rollout_id,
                host.id,
                format!(
                    "Only {free} KiB free on {}, {} KiB required",
                    host.name, options.min_free_space_kb
                ),
            );
            Ok(false)
        }
        Some(free) => {
            debug!(host = %host.name, free, "Free space check passed");
            Ok(true)
        }
    }
}

/// Update one instance. `Ok(false)` stops the host workflow; skipped
/// instances return `Ok(true)`.
async fn update_instance(
    engine: &Engine,
    rollout_id: Uuid,
    artifact: &Artifact,
    host: &Host,
    instance: &Instance,
) -> Result<bool, FleetError> {
    let options = &engine.options.rollout;
    let label = format!("{}:{}", host.name, instance.path);

    if !instance.is_valid {
        note(engine, rollout_id, host.id, format!("Skipped {label}: instance is not valid"));
        return Ok(true);
    }

    let marker = options.anonymous_marker.as_str();
    if instance.version.contains(marker) != artifact.version.contains(marker) {
        note(
            engine,
            rollout_id,
            host.id,
            format!(
                "Skipped {label}: version {} and release {} belong to different classes",
                instance.version, artifact.version
            ),
        );
        return Ok(true);
    }

    let rollout = engine.store.host_rollouts.get(&rollout_id);
    if rollout.map(|r| r.backup).unwrap_or(false) {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let backup = commands_kind(engine, commands::backup(instance, &stamp));
        let (op_id, outcome) = run_operation(engine, rollout_id, host.id, backup).await?;
        if outcome.is_completed() {
            note(engine, rollout_id, host.id, format!("Backed up {label}"));
        } else {
            note(
                engine,
                rollout_id,
                host.id,
                format!(
                    "Backup of {label} {}, continuing{}",
                    describe(outcome),
                    failure_reason(engine, op_id, host.id)
                ),
            );
        }
    }

    let health = &engine.options.health;
    let url = match health_url(&instance.url, &health.path) {
        Ok(url) => url,
        Err(e) => {
            note(engine, rollout_id, host.id, format!("Cannot probe {label}: {e}"));
            return Ok(false);
        }
    };

    if !wait_healthy(engine.health.as_ref(), &url, health.interval, health.timeout).await {
        note(
            engine,
            rollout_id,
            host.id,
            format!("{label} is not healthy before the update, stopping"),
        );
        return Ok(false);
    }

    let update = commands_kind(
        engine,
        commands::update(instance, &options.remote_artifact_path),
    );
    let (op_id, outcome) = run_operation(engine, rollout_id, host.id, update).await?;
    if !outcome.is_completed() {
        note(
            engine,
            rollout_id,
            host.id,
            format!(
                "Update of {label} {} (operation {op_id}){}",
                describe(outcome),
                failure_reason(engine, op_id, host.id)
            ),
        );
        roll_back(engine, rollout_id, host, instance, &label).await;
        return Ok(false);
    }

    if !wait_healthy(engine.health.as_ref(), &url, health.interval, health.timeout).await {
        note(
            engine,
            rollout_id,
            host.id,
            format!("{label} did not become healthy after the update"),
        );
        roll_back(engine, rollout_id, host, instance, &label).await;
        return Ok(false);
    }

    engine.store.instances.update(&instance.id, |i| {
        i.version = artifact.version.clone();
        i.tag = artifact.tag.clone();
        i.ready_to_update = false;
    })?;
    info!(rollout = %rollout_id, instance = %instance.id, "Updated {} to {}", label, artifact.version);
    note(
        engine,
        rollout_id,
        host.id,
        format!("Updated {label} to {}/{}", artifact.version, artifact.tag),
    );
    Ok(true)
}

/// Best-effort restore of the previous release
async fn roll_back(engine: &Engine, rollout_id: Uuid, host: &Host, instance: &Instance, label: &str) {
    let rollback = commands_kind(engine, commands::rollback(instance));
    match run_operation(engine, rollout_id, host.id, rollback).await {
        Ok((_, PollOutcome::Completed)) => {
            note(engine, rollout_id, host.id, format!("Rolled back {label}"));
        }
        Ok((op_id, outcome)) => {
            warn!(rollout = %rollout_id, instance = %instance.id, "Rollback {}", describe(outcome));
            note(
                engine,
                rollout_id,
                host.id,
                format!(
                    "Rollback of {label} {} (operation {op_id}){}",
                    describe(outcome),
                    failure_reason(engine, op_id, host.id)
                ),
            );
        }
        Err(e) => {
            note(engine, rollout_id, host.id, format!("Rollback of {label} not issued: {e}"));
        }
    }
}
