//! Operation execution and fan-out/fan-in

use fleetops::engine::triggers::create_operation;
use fleetops::errors::FleetError;
use fleetops::models::{CommandOutput, ExecProtocol, OperationKind, OperationStatus, OsKind};

use crate::common::{Harness, ScriptedHealth, ScriptedTransport};

fn commands(list: &[&str]) -> OperationKind {
    OperationKind::ExecuteCommand {
        commands: list.iter().map(|c| c.to_string()).collect(),
        protocol: ExecProtocol::Ssh,
        elevate: false,
    }
}

#[tokio::test]
async fn test_missing_credential_fails_host_with_one_log_entry() {
    let harness = Harness::healthy();
    let bare = harness.add_bare_host("bare", OsKind::Linux).await;

    let id = create_operation(&harness.engine, commands(&["uptime"]), vec![bare.id])
        .await
        .unwrap();
    harness.settle().await;

    let op = harness.engine.store.operations.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    let entries: Vec<_> = op.log.for_host(bare.id).collect();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].message.contains("No ssh credential"));
    assert!(harness.transport.commands_on(bare.id).is_empty());
}

#[tokio::test]
async fn test_fan_out_is_strict_and() {
    let transport = ScriptedTransport::new(|host, _| {
        if host.name == "db" {
            Ok(CommandOutput::failure(2, "disk full"))
        } else {
            Ok(CommandOutput::success("ok"))
        }
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let web = harness.add_host("web").await;
    let app = harness.add_host("app").await;
    let db = harness.add_host("db").await;

    let failing = create_operation(
        &harness.engine,
        commands(&["uptime"]),
        vec![web.id, app.id, db.id],
    )
    .await
    .unwrap();
    let passing = create_operation(&harness.engine, commands(&["uptime"]), vec![web.id, app.id])
        .await
        .unwrap();
    harness.settle().await;

    let failing = harness.engine.store.operations.get(&failing).unwrap();
    assert_eq!(failing.status, OperationStatus::Error);
    assert!(failing.log.contains("1 of 3 targets failed"));

    let passing = harness.engine.store.operations.get(&passing).unwrap();
    assert_eq!(passing.status, OperationStatus::Completed);
    assert!(passing.log.contains("Completed on all 2 host(s)"));
}

#[tokio::test]
async fn test_non_zero_exit_stops_remaining_commands() {
    let transport = ScriptedTransport::new(|_, command| match command {
        "false" => Ok(CommandOutput::failure(1, "")),
        other => Ok(CommandOutput::success(other.trim_start_matches("echo "))),
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let host = harness.add_host("web").await;

    let id = create_operation(
        &harness.engine,
        commands(&["echo a", "false", "echo c"]),
        vec![host.id],
    )
    .await
    .unwrap();
    harness.settle().await;

    assert_eq!(harness.transport.commands_on(host.id), vec!["echo a", "false"]);
    let op = harness.engine.store.operations.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.output.len(), 2);
    assert_eq!(op.output[0].stdout, "a");
    assert_eq!(op.output[1].exit_code, Some(1));
    assert!(op.log.contains("Command 2 of 3 exited with 1"));
}

#[tokio::test]
async fn test_transport_error_is_contained_per_host() {
    let transport = ScriptedTransport::new(|host, _| {
        if host.name == "flaky" {
            Err(FleetError::ConnectError("connection reset".to_string()))
        } else {
            Ok(CommandOutput::success(""))
        }
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let flaky = harness.add_host("flaky").await;
    let steady = harness.add_host("steady").await;

    let id = create_operation(&harness.engine, commands(&["true"]), vec![flaky.id, steady.id])
        .await
        .unwrap();
    harness.settle().await;

    let op = harness.engine.store.operations.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op
        .log
        .for_host(flaky.id)
        .any(|e| e.message.contains("connection reset")));
    assert!(op
        .log
        .for_host(steady.id)
        .any(|e| e.message.contains("Ran 1 command(s)")));
}

#[tokio::test]
async fn test_terminal_status_never_changes() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;

    let id = create_operation(&harness.engine, commands(&["true"]), vec![host.id])
        .await
        .unwrap();
    harness.settle().await;

    for next in [
        OperationStatus::Queued,
        OperationStatus::Running,
        OperationStatus::Error,
        OperationStatus::Completed,
    ] {
        let result = harness
            .engine
            .store
            .operations
            .update(&id, |op| op.advance(next))
            .unwrap();
        assert!(matches!(result, Err(FleetError::InvalidTransition(_))));
    }
    let op = harness.engine.store.operations.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_log_sequence_is_strictly_increasing_under_concurrency() {
    let harness = Harness::healthy();
    let mut hosts = Vec::new();
    for i in 0..8 {
        hosts.push(harness.add_host(&format!("node-{i}")).await.id);
    }

    let id = create_operation(&harness.engine, commands(&["a", "b", "c"]), hosts)
        .await
        .unwrap();
    harness.settle().await;

    let op = harness.engine.store.operations.get(&id).unwrap();
    assert_eq!(op.output.len(), 24);
    let entries = op.log.entries();
    assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq && w[0].at <= w[1].at));
}

#[tokio::test]
async fn test_rejects_invalid_requests() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;

    let empty = create_operation(&harness.engine, commands(&[]), vec![host.id]).await;
    assert!(matches!(empty, Err(FleetError::ValidationError(_))));

    let blank = create_operation(&harness.engine, commands(&["  "]), vec![host.id]).await;
    assert!(matches!(blank, Err(FleetError::ValidationError(_))));

    let unknown =
        create_operation(&harness.engine, commands(&["true"]), vec![uuid::Uuid::new_v4()]).await;
    assert!(matches!(unknown, Err(FleetError::NotFound(_))));

    assert!(harness.engine.store.operations.is_empty());
}

#[tokio::test]
async fn test_aborted_host_task_is_logged_and_fails_operation() {
    let transport = ScriptedTransport::new(|host, _| {
        if host.name == "crash" {
            panic!("transport crashed");
        }
        Ok(CommandOutput::success("ok"))
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let crash = harness.add_host("crash").await;
    let steady = harness.add_host("steady").await;

    let id = create_operation(&harness.engine, commands(&["uptime"]), vec![crash.id, steady.id])
        .await
        .unwrap();
    harness.settle().await;

    let op = harness.engine.store.operations.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.log.contains("1 of 2 targets failed"));
    let entries: Vec<_> = op.log.for_host(crash.id).collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "Host task aborted unexpectedly");
    assert_eq!(op.stdout_for(steady.id), "ok");
}
