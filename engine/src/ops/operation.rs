//! Running one operation on one host

use std::path::PathBuf;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::FleetError;
use crate::models::{FileSource, Host, Operation, OperationKind};
use crate::transport::Session;

/// Execute operation `op_id` on `host_id`.
///
/// Never fails: every error is logged against the host and reported as
/// `false`, so one host cannot take down its siblings.
pub async fn run_on_host(engine: &Engine, op_id: Uuid, host_id: Uuid) -> bool {
    match execute(engine, op_id, host_id).await {
        Ok(succeeded) => succeeded,
        Err(e) => {
            warn!(operation = %op_id, host = %host_id, "Operation failed on host: {}", e);
            if let Err(log_err) = engine
                .store
                .log_operation(&op_id, Some(host_id), format!("Failed: {e}"))
            {
                warn!(operation = %op_id, "Failed to record host failure: {}", log_err);
            }
            false
        }
    }
}

async fn execute(engine: &Engine, op_id: Uuid, host_id: Uuid) -> Result<bool, FleetError> {
    let op = engine.store.operations.require(&op_id)?;
    let host = engine
        .inventory
        .host(&host_id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("host {host_id}")))?;

    let kind = op.kind.credential_kind();
    let Some(credential) = engine.inventory.resolve_credential(&host, kind).await else {
        let missing = FleetError::CredentialMissing {
            host: host.name.clone(),
            kind: kind.to_string(),
        };
        warn!(operation = %op_id, host = %host_id, "{}", missing);
        engine
            .store
            .log_operation(&op_id, Some(host_id), missing.to_string())?;
        return Ok(false);
    };

    let transport = engine.transports.for_kind(&op.kind);
    let mut session = transport.connect(&host, &credential).await?;
    debug!(operation = %op_id, host = %host.name, "Session open");

    let result = match &op.kind {
        OperationKind::ExecuteCommand {
            commands, elevate, ..
        } => run_commands(engine, &op, &host, session.as_mut(), commands, *elevate).await,
        OperationKind::SendFile {
            source,
            destination,
            ..
        } => send_file(engine, &op, &host, session.as_mut(), source, destination).await,
    };

    if let Err(e) = session.close().await {
        debug!(operation = %op_id, host = %host.name, "Failed to close session: {}", e);
    }
    result
}

/// Run commands in order, persisting each result before the next command.
/// A non-zero exit stops the sequence.
async fn run_commands(
    engine: &Engine,
    op: &Operation,
    host: &Host,
    session: &mut dyn Session,
    commands: &[String],
    elevate: bool,
) -> Result<bool, FleetError> {
    for (index, command) in commands.iter().enumerate() {
        let output = session.run_command(command, elevate).await?;
        engine
            .store
            .operations
            .update(&op.id, |record| record.record_output(host.id, index, &output))?;

        if !output.succeeded() {
            let code = output.exit_code.unwrap_or_default();
            warn!(
                operation = %op.id,
                host = %host.name,
                "Command {} of {} exited with {}",
                index + 1,
                commands.len(),
                code
            );
            engine.store.log_operation(
                &op.id,
                Some(host.id),
                format!(
                    "Command {} of {} exited with {} on {}",
                    index + 1,
                    commands.len(),
                    code,
                    host.name
                ),
            )?;
            return Ok(false);
        }
    }

    engine.store.log_operation(
        &op.id,
        Some(host.id),
        format!("Ran {} command(s) on {}", commands.len(), host.name),
    )?;
    Ok(true)
}

async fn send_file(
    engine: &Engine,
    op: &Operation,
    host: &Host,
    session: &mut dyn Session,
    source: &FileSource,
    destination: &str,
) -> Result<bool, FleetError> {
    let local = resolve_source(engine, source)?;
    if !tokio::fs::try_exists(&local).await.unwrap_or(false) {
        return Err(FleetError::ValidationError(format!(
            "source file {} does not exist",
            local.display()
        )));
    }

    session.send_file(&local, destination).await?;
    info!(operation = %op.id, host = %host.name, "Sent {} to {}", local.display(), destination);
    engine.store.log_operation(
        &op.id,
        Some(host.id),
        format!("Sent {} to {}:{}", local.display(), host.name, destination),
    )?;
    Ok(true)
}

fn resolve_source(engine: &Engine, source: &FileSource) -> Result<PathBuf, FleetError> {
    match source {
        FileSource::Local { path } => Ok(path.clone()),
        FileSource::Artifact { id } => Ok(engine.store.artifacts.require(id)?.file),
    }
}
