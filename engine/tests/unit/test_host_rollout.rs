//! Host-parallel update workflow

use fleetops::engine::triggers::{create_host_rollout, delete_host_rollout};
use fleetops::errors::FleetError;
use fleetops::models::{CommandOutput, OperationStatus};

use crate::common::{release_script, Harness, ScriptedHealth, ScriptedTransport};

fn ran(commands: &[String], needle: &str) -> bool {
    commands.iter().any(|c| c.contains(needle))
}

#[tokio::test]
async fn test_updates_instance_and_records_release() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    harness
        .engine
        .store
        .instances
        .update(&instance.id, |i| i.ready_to_update = true)
        .unwrap();
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], false).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert_eq!(rollout.host_results.get(&host.id), Some(&true));
    assert!(rollout.log.contains("All 1 host(s) updated"));

    let updated = harness.engine.store.instances.get(&instance.id).unwrap();
    assert_eq!(updated.version, "1.2");
    assert_eq!(updated.tag, "stable");
    assert!(!updated.ready_to_update);

    let commands = harness.transport.commands_on(host.id);
    assert!(commands[0].starts_with("df -Pk /tmp"));
    assert!(ran(&commands, "mv /opt/app /opt/app.prev"));
    assert!(!ran(&commands, ".bak-"));
    assert_eq!(
        harness.transport.sends_to(host.id),
        vec!["/tmp/fleetops-release.tar.gz"]
    );
    // one probe before and one after the update
    assert_eq!(harness.health.calls(), 2);
}

#[tokio::test]
async fn test_low_free_space_stops_only_that_host() {
    let transport = ScriptedTransport::new(|host, command| {
        if host.name == "small" && command.starts_with("df ") {
            return Ok(CommandOutput::success("1024"));
        }
        release_script(host, command)
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let small = harness.add_host("small").await;
    let large = harness.add_host("large").await;
    let cramped = harness.add_instance(&small, "/opt/app", "1.1");
    let roomy = harness.add_instance(&large, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![cramped.id, roomy.id], false)
        .unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert_eq!(rollout.host_results.get(&small.id), Some(&false));
    assert_eq!(rollout.host_results.get(&large.id), Some(&true));
    assert!(rollout.log.contains("Only 1024 KiB free on small"));
    assert!(rollout.log.contains("1 of 2 host(s) failed"));

    assert!(harness.transport.sends_to(small.id).is_empty());
    assert_eq!(harness.transport.commands_on(small.id).len(), 1);
    assert_eq!(harness.transport.sends_to(large.id).len(), 1);

    let instances = &harness.engine.store.instances;
    assert_eq!(instances.get(&cramped.id).unwrap().version, "1.1");
    assert_eq!(instances.get(&roomy.id).unwrap().version, "1.2");
}

#[tokio::test]
async fn test_class_mismatch_is_skipped_and_host_continues() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let anonymous = harness.add_instance(&host, "/opt/anon", "1.0-anonymous");
    let regular = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(
        &harness.engine,
        artifact.id,
        vec![anonymous.id, regular.id],
        false,
    )
    .unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert!(rollout.log.contains("belong to different classes"));

    let instances = &harness.engine.store.instances;
    assert_eq!(instances.get(&anonymous.id).unwrap().version, "1.0-anonymous");
    assert_eq!(instances.get(&regular.id).unwrap().version, "1.2");

    let commands = harness.transport.commands_on(host.id);
    assert!(!ran(&commands, "/opt/anon.prev"));
    assert!(ran(&commands, "mv /opt/app /opt/app.prev"));
}

#[tokio::test]
async fn test_unhealthy_after_update_rolls_back() {
    let health = ScriptedHealth::new(|n| {
        Ok(if n == 0 { "UP" } else { "DOWN" }.to_string())
    });
    let harness = Harness::new(ScriptedTransport::new(release_script), health);
    let host = harness.add_host("web").await;
    let first = harness.add_instance(&host, "/opt/first", "1.1");
    let second = harness.add_instance(&host, "/opt/second", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![first.id, second.id], false)
        .unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert!(rollout.log.contains("did not become healthy after the update"));
    assert!(rollout.log.contains("Rolled back web:/opt/first"));

    let commands = harness.transport.commands_on(host.id);
    assert!(commands
        .iter()
        .any(|c| c.starts_with("if [ -d /opt/first.prev ]")));
    // the host stops at the first failed instance
    assert!(!ran(&commands, "/opt/second"));

    let instances = &harness.engine.store.instances;
    assert_eq!(instances.get(&first.id).unwrap().version, "1.1");
    assert_eq!(instances.get(&second.id).unwrap().version, "1.1");
}

#[tokio::test]
async fn test_unhealthy_before_update_fails_without_touching_instance() {
    let harness = Harness::new(
        ScriptedTransport::new(release_script),
        ScriptedHealth::always("DOWN"),
    );
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], false).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert!(rollout.log.contains("is not healthy before the update"));

    let commands = harness.transport.commands_on(host.id);
    assert!(!ran(&commands, "mv /opt/app"));
    assert!(!ran(&commands, "if [ -d"));
}

#[tokio::test]
async fn test_backup_runs_before_update() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], true).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert!(rollout.log.contains("Backed up web:/opt/app"));

    let commands = harness.transport.commands_on(host.id);
    let backup = commands.iter().position(|c| c.contains("/opt/app.bak-")).unwrap();
    let swap = commands.iter().position(|c| c.starts_with("mv /opt/app")).unwrap();
    assert!(backup < swap);
}

#[tokio::test]
async fn test_failed_backup_does_not_stop_update() {
    let transport = ScriptedTransport::new(|host, command| {
        if command.starts_with("cp -a") {
            return Ok(CommandOutput::failure(1, "cp: No space left on device"));
        }
        release_script(host, command)
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], true).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Completed);
    assert!(rollout.log.contains("Backup of web:/opt/app failed, continuing"));
    assert!(!rollout.log.contains("Backed up web:/opt/app"));
    assert_eq!(
        harness.engine.store.instances.get(&instance.id).unwrap().version,
        "1.2"
    );
    assert!(ran(&harness.transport.commands_on(host.id), "mv /opt/app /opt/app.prev"));
}

#[tokio::test]
async fn test_failed_transfer_stops_only_that_host() {
    let transport = ScriptedTransport::new(release_script).with_sends(|host, remote| {
        if host.name == "cut" {
            return Err(FleetError::TransportError(format!("link dropped while writing {remote}")));
        }
        Ok(())
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let cut = harness.add_host("cut").await;
    let linked = harness.add_host("linked").await;
    let stranded = harness.add_instance(&cut, "/opt/app", "1.1");
    let reached = harness.add_instance(&linked, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![stranded.id, reached.id], false)
        .unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert_eq!(rollout.host_results.get(&cut.id), Some(&false));
    assert_eq!(rollout.host_results.get(&linked.id), Some(&true));
    assert!(rollout.log.contains("to cut failed"));
    assert!(rollout.log.contains("link dropped"));
    assert!(rollout.log.contains("1 of 2 host(s) failed"));

    // only the free space check ran before the transfer gave up
    assert_eq!(harness.transport.commands_on(cut.id).len(), 1);
    assert!(harness.transport.sends_to(cut.id).is_empty());

    let instances = &harness.engine.store.instances;
    assert_eq!(instances.get(&stranded.id).unwrap().version, "1.1");
    assert_eq!(instances.get(&reached.id).unwrap().version, "1.2");
    // only the reachable host's instance was health-checked
    assert_eq!(harness.health.calls(), 2);
}

#[tokio::test]
async fn test_aborted_host_workflow_is_logged() {
    let health = ScriptedHealth::new(|_| panic!("health client crashed"));
    let harness = Harness::new(ScriptedTransport::new(release_script), health);
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], false).unwrap();
    harness.settle().await;

    let rollout = harness.engine.store.host_rollouts.get(&id).unwrap();
    assert_eq!(rollout.status, OperationStatus::Error);
    assert_eq!(rollout.host_results.get(&host.id), Some(&false));
    let entries: Vec<_> = rollout.log.for_host(host.id).collect();
    assert!(entries
        .iter()
        .any(|e| e.message == "Host workflow aborted unexpectedly"));
    assert_eq!(
        harness.engine.store.instances.get(&instance.id).unwrap().version,
        "1.1"
    );
}

#[tokio::test]
async fn test_finished_rollout_can_be_deleted() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], false).unwrap();
    harness.settle().await;

    delete_host_rollout(&harness.engine, id).unwrap();
    assert!(harness.engine.store.host_rollouts.get(&id).is_none());
    let orphans = harness.engine.store.operations.find(|op| op.parent == Some(id));
    assert!(orphans.is_empty());
    assert!(!harness.engine.store.operations.is_empty());
}
