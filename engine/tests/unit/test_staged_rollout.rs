//! Staged rollout pipeline

use fleetops::engine::triggers::create_staged_rollout;
use std::time::Duration;

use fleetops::models::{CommandOutput, Operation, OperationKind, OperationStatus, Stage};
use uuid::Uuid;

use crate::common::{release_script, Harness, ScriptedHealth, ScriptedTransport};

fn issued_by(harness: &Harness, rollout: Uuid) -> Vec<Operation> {
    harness
        .engine
        .store
        .operations
        .find(|op| op.parent == Some(rollout))
}

fn is_pull(op: &Operation) -> bool {
    matches!(&op.kind, OperationKind::ExecuteCommand { commands, .. }
        if commands.iter().any(|c| c.contains("pull -q")))
}

#[tokio::test]
async fn test_prepares_valid_instances_through_every_stage() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![instance.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert_eq!(rollout.stage, Stage::PullImages);
    assert!(rollout.pending.is_empty());
    assert!(rollout.log.contains("Completed: 1 instance(s) ready to update"));
    assert!(harness.engine.store.instances.get(&instance.id).unwrap().ready_to_update);

    // one operation per stage
    assert_eq!(issued_by(&harness, id).len(), 3);
    let sends = harness.transport.sends_to(host.id);
    assert_eq!(sends.len(), 1);
    assert!(sends[0].ends_with(&format!("{}-{}.tar.gz", artifact.id, instance.id)));
}

#[tokio::test]
async fn test_invalid_instance_is_excluded_before_first_stage() {
    let harness = Harness::healthy();
    let good_host = harness.add_host("good").await;
    let bad_host = harness.add_host("bad").await;
    let good = harness.add_instance(&good_host, "/opt/app", "1.1");
    let bad = harness.add_invalid_instance(&bad_host, "/opt/app");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![good.id, bad.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert!(rollout.log.contains(&format!("Excluded instance {}", bad.id)));
    assert!(rollout.log.contains("Started with 1 of 2 instance(s)"));

    let ops = issued_by(&harness, id);
    assert!(ops.iter().all(|op| op.hosts == vec![good_host.id]));
    assert!(harness.transport.sends_to(bad_host.id).is_empty());
    assert!(harness.transport.commands_on(bad_host.id).is_empty());
    assert!(!harness.engine.store.instances.get(&bad.id).unwrap().ready_to_update);
}

#[tokio::test]
async fn test_failed_validation_prunes_only_that_instance() {
    let transport = ScriptedTransport::new(|host, command| {
        if command.contains("/opt/stale.next/version.env") {
            return Ok(CommandOutput::success("BRANCH=1.1\nTAG=old\n"));
        }
        release_script(host, command)
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let host_a = harness.add_host("a").await;
    let host_c = harness.add_host("c").await;
    let stale = harness.add_instance(&host_a, "/opt/stale", "1.1");
    let fresh = harness.add_instance(&host_c, "/opt/fresh", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![stale.id, fresh.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert_eq!(rollout.active, vec![fresh.id]);
    assert!(rollout.log.contains(&format!(
        "Eliminated instance {} at stage 'unpack and prepare'",
        stale.id
    )));

    let pulls: Vec<Operation> = issued_by(&harness, id).into_iter().filter(is_pull).collect();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].hosts, vec![host_c.id]);

    let instances = &harness.engine.store.instances;
    assert!(!instances.get(&stale.id).unwrap().ready_to_update);
    assert!(instances.get(&fresh.id).unwrap().ready_to_update);
}

#[tokio::test]
async fn test_all_instances_failing_a_stage_errors_the_rollout() {
    let transport = ScriptedTransport::new(|host, command| {
        if command.starts_with("tar -xzf") {
            return Ok(CommandOutput::failure(2, "gzip: stdin: unexpected end of file"));
        }
        release_script(host, command)
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let host = harness.add_host("web").await;
    let first = harness.add_instance(&host, "/opt/one", "1.1");
    let second = harness.add_instance(&host, "/opt/two", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![first.id, second.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert!(rollout.log.contains("All instances failed stage 'unpack and prepare'"));
    assert!(!issued_by(&harness, id).iter().any(is_pull));
}

#[tokio::test]
async fn test_stage_without_operations_stops_the_pipeline() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let invalid = harness.add_invalid_instance(&host, "/opt/app");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![invalid.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert!(rollout
        .log
        .contains("Stage 'distribute artifact' produced no operations, stopping"));
    assert!(issued_by(&harness, id).is_empty());
}

#[tokio::test]
async fn test_image_count_mismatch_prunes_instance() {
    let transport = ScriptedTransport::new(|host, command| {
        if command.contains("image inspect") {
            return Ok(CommandOutput::success("2"));
        }
        release_script(host, command)
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![instance.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert!(rollout.log.contains("at stage 'pull images'"));
    assert!(rollout.log.contains("All instances failed stage 'pull images'"));
}

#[tokio::test]
async fn test_unfinished_operation_is_pruned_when_stage_budget_runs_out() {
    let transport = ScriptedTransport::new(release_script).with_stall(|host, command| {
        (host.name == "slow" && command.starts_with("tar -xzf")).then(|| Duration::from_millis(600))
    });
    let harness = Harness::with_options(transport, ScriptedHealth::always("UP"), |options| {
        options.poll.timeout = Duration::from_millis(150);
    });
    let slow_host = harness.add_host("slow").await;
    let fast_host = harness.add_host("fast").await;
    let slow = harness.add_instance(&slow_host, "/opt/app", "1.1");
    let fast = harness.add_instance(&fast_host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![slow.id, fast.id]).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.staged_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert_eq!(rollout.active, vec![fast.id]);
    assert!(rollout.log.contains(&format!(
        "Eliminated instance {} at stage 'unpack and prepare'",
        slow.id
    )));
    assert!(rollout.log.contains("did not finish in time"));

    let instances = &harness.engine.store.instances;
    assert!(!instances.get(&slow.id).unwrap().ready_to_update);
    assert!(instances.get(&fast.id).unwrap().ready_to_update);

    let pulls: Vec<_> = issued_by(&harness, id).into_iter().filter(is_pull).collect();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].hosts, vec![fast_host.id]);
}
