//! Staged rollout state machine
//!
//! A rollout walks its instances through the stage table. Every stage issues
//! one operation per surviving instance and is checked from the task queue
//! until all of them are terminal, so no worker waits on another. Instances
//! whose operation fails, times out or does not validate are pruned; the
//! rollout only errors when nothing survives a stage.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::FleetError;
use crate::models::{Operation, OperationStatus, Stage, StagedRollout};
use crate::ops::poll::{self, PollOutcome};
use crate::ops::scheduler::submit;
use crate::rollout::fsm::{descriptor, StageContext, FIRST_STAGE};

/// Exclude instances that cannot take part and launch the first stage
pub fn start(engine: &Engine, rollout_id: Uuid) -> Result<(), FleetError> {
    let rollout = engine.store.staged_rollouts.require(&rollout_id)?;
    if let Err(e) = engine.store.artifacts.require(&rollout.artifact) {
        fail(engine, rollout_id, format!("Cannot start: {e}"));
        return Err(e);
    }

    let mut active = Vec::new();
    let mut excluded = Vec::new();
    for id in &rollout.instances {
        match engine.store.instances.get(id) {
            Some(instance) if instance.is_valid => active.push(instance.id),
            Some(instance) => excluded.push(format!(
                "Excluded instance {} ({}): introspection did not validate it",
                instance.id, instance.path
            )),
            None => excluded.push(format!("Excluded instance {id}: not found")),
        }
    }

    engine.store.staged_rollouts.update(&rollout_id, |r| {
        for line in &excluded {
            r.log.append(None, line.clone());
        }
        r.active = active.clone();
        r.log.append(
            None,
            format!("Started with {} of {} instance(s)", active.len(), r.instances.len()),
        );
        r.advance(OperationStatus::Running)
    })??;
    info!(rollout = %rollout_id, active = active.len(), excluded = excluded.len(), "Staged rollout started");

    launch_stage(engine, rollout_id, FIRST_STAGE);
    Ok(())
}

/// Issue one operation per active instance for `stage` and schedule its check
fn launch_stage(engine: &Engine, rollout_id: Uuid, stage: Stage) {
    let stage_desc = descriptor(stage);
    let Some(rollout) = engine.store.staged_rollouts.get(&rollout_id) else {
        debug!(rollout = %rollout_id, "Rollout removed before stage {}", stage_desc.name);
        return;
    };
    let artifact = match engine.store.artifacts.require(&rollout.artifact) {
        Ok(artifact) => artifact,
        Err(e) => {
            fail(engine, rollout_id, format!("Stage '{}' cannot run: {e}", stage_desc.name));
            return;
        }
    };

    let mut pending = BTreeMap::new();
    let mut issue_errors = Vec::new();
    for instance in engine.store.instances.filter(&rollout.active) {
        let ctx = StageContext {
            instance: &instance,
            artifact: &artifact,
            options: &engine.options.rollout,
        };
        let operation = Operation::new((stage_desc.build)(&ctx), vec![instance.host])
            .with_parent(rollout_id);
        match submit(engine, operation) {
            Ok(op_id) => {
                pending.insert(op_id, instance.id);
            }
            Err(e) => issue_errors.push(format!(
                "Excluded instance {} ({}): could not issue stage '{}': {e}",
                instance.id, instance.path, stage_desc.name
            )),
        }
    }

    if pending.is_empty() {
        fail(
            engine,
            rollout_id,
            format!("Stage '{}' produced no operations, stopping", stage_desc.name),
        );
        return;
    }

    let issued: Vec<Uuid> = pending.values().copied().collect();
    let updated = engine.store.staged_rollouts.update(&rollout_id, |r| {
        for line in &issue_errors {
            r.log.append(None, line.clone());
        }
        r.active = issued.clone();
        r.stage = stage;
        r.pending = pending.clone();
        r.log.append(
            None,
            format!("Stage '{}': issued {} operation(s)", stage_desc.name, pending.len()),
        );
    });
    if updated.is_err() {
        debug!(rollout = %rollout_id, "Rollout removed while issuing stage {}", stage_desc.name);
        return;
    }
    info!(rollout = %rollout_id, stage = stage_desc.name, operations = pending.len(), "Stage started");

    let deadline = Instant::now() + engine.options.poll.timeout;
    schedule_check(engine, rollout_id, 0, Duration::ZERO, deadline);
}

fn schedule_check(
    engine: &Engine,
    rollout_id: Uuid,
    attempt: u32,
    delay: Duration,
    deadline: Instant,
) {
    let task_engine = engine.clone();
    engine.queue.schedule_after(delay, async move {
        check_stage(&task_engine, rollout_id, attempt, deadline);
    });
}

/// Reason an instance leaves the pipeline
enum Pruned {
    Failed,
    TimedOut,
    Invalid(String),
    Missing,
}

/// Re-entrant stage check: reschedules itself while operations are still
/// running, otherwise prunes and moves on
fn check_stage(engine: &Engine, rollout_id: Uuid, attempt: u32, deadline: Instant) {
    let Some(rollout) = engine.store.staged_rollouts.get(&rollout_id) else {
        debug!(rollout = %rollout_id, "Rollout removed, dropping stage check");
        return;
    };
    if rollout.status.is_terminal() {
        return;
    }
    let stage_desc = descriptor(rollout.stage);

    let outcomes: Vec<(Uuid, Uuid, Option<PollOutcome>)> = rollout
        .pending
        .iter()
        .map(|(op_id, instance_id)| (*op_id, *instance_id, poll::check(&engine.store, op_id)))
        .collect();

    let waiting = outcomes.iter().filter(|(_, _, o)| o.is_none()).count();
    if waiting > 0 {
        if let Some(delay) = poll::retry_after(&engine.options.poll, attempt, deadline) {
            debug!(rollout = %rollout_id, attempt, waiting, "Stage '{}' still running", stage_desc.name);
            schedule_check(engine, rollout_id, attempt + 1, delay, deadline);
            return;
        }
    }

    let artifact = engine.store.artifacts.get(&rollout.artifact);
    let mut pruned: Vec<(Uuid, Uuid, Pruned)> = Vec::new();
    for (op_id, instance_id, outcome) in outcomes {
        let reason = match outcome {
            None => Some(Pruned::TimedOut),
            Some(PollOutcome::Failed) | Some(PollOutcome::TimedOut) => Some(Pruned::Failed),
            Some(PollOutcome::Completed) => {
                match (
                    engine.store.operations.get(&op_id),
                    engine.store.instances.get(&instance_id),
                    artifact.as_ref(),
                ) {
                    (Some(op), Some(instance), Some(artifact)) => {
                        let ctx = StageContext {
                            instance: &instance,
                            artifact,
                            options: &engine.options.rollout,
                        };
                        (stage_desc.validate)(&op, &ctx).err().map(Pruned::Invalid)
                    }
                    _ => Some(Pruned::Missing),
                }
            }
        };
        if let Some(reason) = reason {
            pruned.push((op_id, instance_id, reason));
        }
    }

    let survivors: Vec<Uuid> = rollout
        .pending
        .values()
        .filter(|id| !pruned.iter().any(|(_, p, _)| p == *id))
        .copied()
        .collect();

    let name = stage_desc.name;
    let result = engine.store.staged_rollouts.update(&rollout_id, |r| {
        for (op_id, instance_id, reason) in &pruned {
            let line = match reason {
                Pruned::Failed => format!(
                    "Eliminated instance {instance_id} at stage '{name}': operation {op_id} failed"
                ),
                Pruned::TimedOut => format!(
                    "Eliminated instance {instance_id} at stage '{name}': operation {op_id} did not finish in time"
                ),
                Pruned::Invalid(why) => format!(
                    "Eliminated instance {instance_id} at stage '{name}': validation failed: {why}"
                ),
                Pruned::Missing => format!(
                    "Eliminated instance {instance_id} at stage '{name}': records vanished"
                ),
            };
            r.log.append(None, line);
        }
        r.pending.clear();
        r.active = survivors.clone();
        r.log.append(
            None,
            format!("Stage '{name}' finished: {} instance(s) remain", survivors.len()),
        );
    });
    if result.is_err() {
        return;
    }
    for (_, instance_id, reason) in &pruned {
        if let Pruned::TimedOut = reason {
            warn!(rollout = %rollout_id, instance = %instance_id, "Stage '{}' timed out", name);
        } else {
            warn!(rollout = %rollout_id, instance = %instance_id, "Instance eliminated at stage '{}'", name);
        }
    }

    if survivors.is_empty() {
        fail(engine, rollout_id, format!("All instances failed stage '{name}'"));
        return;
    }

    match stage_desc.next {
        Some(next) => launch_stage(engine, rollout_id, next),
        None => complete(engine, rollout_id, &survivors),
    }
}

fn complete(engine: &Engine, rollout_id: Uuid, survivors: &[Uuid]) {
    for id in survivors {
        if let Err(e) = engine.store.instances.update(id, |i| i.ready_to_update = true) {
            warn!(rollout = %rollout_id, instance = %id, "Could not flag instance: {}", e);
        }
    }

    let result = engine.store.staged_rollouts.update(&rollout_id, |r| {
        r.log.append(
            None,
            format!("Completed: {} instance(s) ready to update", survivors.len()),
        );
        r.advance(OperationStatus::Completed)
    });
    match result {
        Ok(Ok(())) => info!(rollout = %rollout_id, ready = survivors.len(), "Staged rollout completed"),
        Ok(Err(e)) | Err(e) => error!(rollout = %rollout_id, "Could not complete rollout: {}", e),
    }
}

/// Move the rollout to `error` with a final log line
pub(crate) fn fail(engine: &Engine, rollout_id: Uuid, message: String) {
    error!(rollout = %rollout_id, "{}", message);
    let result = engine.store.staged_rollouts.update(&rollout_id, |r: &mut StagedRollout| {
        r.pending.clear();
        r.log.append(None, message);
        if !r.status.is_terminal() {
            let _ = r.advance(OperationStatus::Error);
        }
    });
    if let Err(e) = result {
        debug!(rollout = %rollout_id, "Could not record failure: {}", e);
    }
}
