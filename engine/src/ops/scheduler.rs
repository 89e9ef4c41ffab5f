//! Fan-out/fan-in dispatch of an operation across its hosts

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::FleetError;
use crate::models::{Operation, OperationStatus};
use crate::ops::operation::run_on_host;

/// Overall status from per-host results: completed only if every host succeeded
pub fn aggregate(results: &[bool]) -> OperationStatus {
    if results.iter().all(|ok| *ok) {
        OperationStatus::Completed
    } else {
        OperationStatus::Error
    }
}

/// Mark the operation running and run it on every target host concurrently.
/// The final status is derived once, after all hosts have finished.
pub fn dispatch(engine: &Engine, op_id: Uuid) -> Result<(), FleetError> {
    let hosts = engine
        .store
        .operations
        .update(&op_id, |op| {
            op.advance(OperationStatus::Running)?;
            op.log
                .append(None, format!("Started {} on {} host(s)", op.kind.label(), op.hosts.len()));
            Ok::<_, FleetError>(op.hosts.clone())
        })
        .and_then(|r| r)?;
    info!(operation = %op_id, hosts = hosts.len(), "Dispatching operation");

    let tasks: Vec<_> = hosts
        .iter()
        .map(|host| {
            let engine = engine.clone();
            let host = *host;
            async move { run_on_host(&engine, op_id, host).await }
        })
        .collect();

    let joiner = engine.clone();
    engine.queue.group_then_join(tasks, move |results| async move {
        finish(&joiner, op_id, &hosts, results);
    });
    Ok(())
}

/// Store a new operation and dispatch it
pub fn submit(engine: &Engine, operation: Operation) -> Result<Uuid, FleetError> {
    let id = engine.store.operations.insert(operation);
    dispatch(engine, id)?;
    Ok(id)
}

fn finish(engine: &Engine, op_id: Uuid, hosts: &[Uuid], results: Vec<Option<bool>>) {
    let outcomes: Vec<bool> = hosts
        .iter()
        .zip(results)
        .map(|(host, result)| {
            result.unwrap_or_else(|| {
                warn!(operation = %op_id, host = %host, "Host task aborted");
                if let Err(e) = engine.store.log_operation(
                    &op_id,
                    Some(*host),
                    "Host task aborted unexpectedly",
                ) {
                    error!(operation = %op_id, "Failed to record aborted host: {}", e);
                }
                false
            })
        })
        .collect();

    let status = aggregate(&outcomes);
    let failed = outcomes.iter().filter(|ok| !**ok).count();
    let summary = if failed == 0 {
        format!("Completed on all {} host(s)", outcomes.len())
    } else {
        FleetError::PartialFailure {
            failed,
            total: outcomes.len(),
        }
        .to_string()
    };

    let result = engine.store.operations.update(&op_id, |op| {
        op.log.append(None, summary.clone());
        op.advance(status)
    });
    match result {
        Ok(Ok(())) if failed == 0 => info!(operation = %op_id, "{}", summary),
        Ok(Ok(())) => warn!(operation = %op_id, "{}", summary),
        Ok(Err(e)) | Err(e) => error!(operation = %op_id, "Failed to finish operation: {}", e),
    }
}
