//! Instance registration, introspection and deletions

use fleetops::engine::triggers::{
    create_host_rollout, create_staged_rollout, delete_host, delete_host_rollout,
    delete_staged_rollout, register_instance,
};
use fleetops::errors::FleetError;
use fleetops::inventory::Inventory;
use fleetops::models::{CommandOutput, ComposeVariant, OperationStatus, OsKind};

use tokio_test::{assert_err, assert_ok};

use crate::common::{release_script, Harness, ScriptedHealth, ScriptedTransport};

fn introspection_script() -> ScriptedTransport {
    ScriptedTransport::new(|host, command| {
        if command.starts_with("cat /srv/etalon/version.env") {
            return Ok(CommandOutput::success(
                "BRANCH=1.1\nTAG=rc1\nURL=http://10.0.0.7:8080\nSTAND=qa\n",
            ));
        }
        if command.contains("docker compose version") {
            return Ok(CommandOutput::success("COMPOSE=standalone\n"));
        }
        release_script(host, command)
    })
}

#[tokio::test]
async fn test_registration_introspects_instance() {
    let harness = Harness::new(introspection_script(), ScriptedHealth::always("UP"));
    let host = harness.add_host("web").await;

    let instance = register_instance(&harness.engine, host.id, "/srv/etalon/".to_string())
        .await
        .unwrap();
    assert_eq!(instance.path, "/srv/etalon");
    assert!(!instance.is_valid);
    harness.settle().await;

    let instance = harness.engine.store.instances.get(&instance.id).unwrap();
    assert!(instance.is_valid);
    assert_eq!(instance.invalid_reason, None);
    assert_eq!(instance.version, "1.1");
    assert_eq!(instance.tag, "rc1");
    assert_eq!(instance.url, "http://10.0.0.7:8080");
    assert_eq!(instance.stand, "qa");
    assert_eq!(instance.compose, ComposeVariant::Standalone);

    let introspection = harness
        .engine
        .store
        .operations
        .find(|op| op.parent == Some(instance.id));
    assert_eq!(introspection.len(), 1);
    assert_eq!(introspection[0].status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_registration_without_release_files_marks_invalid() {
    let transport = ScriptedTransport::new(|_, command| {
        if command.starts_with("cat ") {
            return Ok(CommandOutput::failure(1, "No such file or directory"));
        }
        Ok(CommandOutput::success(""))
    });
    let harness = Harness::new(transport, ScriptedHealth::always("UP"));
    let host = harness.add_host("web").await;

    let instance = register_instance(&harness.engine, host.id, "/opt/missing".to_string())
        .await
        .unwrap();
    harness.settle().await;

    let instance = harness.engine.store.instances.get(&instance.id).unwrap();
    assert!(!instance.is_valid);
    assert!(instance.version.is_empty());
    let reason = instance.invalid_reason.unwrap();
    assert!(reason.starts_with("introspection operation"), "{reason}");
    assert!(reason.ends_with("failed"), "{reason}");
}

#[tokio::test]
async fn test_windows_host_instance_is_invalid() {
    let harness = Harness::healthy();
    let host = harness.add_bare_host("win", OsKind::Windows).await;

    let instance = register_instance(&harness.engine, host.id, "/opt/app".to_string())
        .await
        .unwrap();
    harness.settle().await;

    let instance = harness.engine.store.instances.get(&instance.id).unwrap();
    assert!(!instance.is_valid);
    assert!(instance
        .invalid_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("win is a Windows host")));
    assert!(harness.engine.store.operations.is_empty());
    assert!(harness.transport.commands_on(host.id).is_empty());
}

#[tokio::test]
async fn test_registration_rejects_bad_input() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;

    for path in ["opt/app", "/opt/app; reboot", "/opt/../etc", ""] {
        let result = register_instance(&harness.engine, host.id, path.to_string()).await;
        assert!(
            matches!(result, Err(FleetError::ValidationError(_))),
            "{path:?} should be rejected"
        );
    }

    let unknown = register_instance(&harness.engine, uuid::Uuid::new_v4(), "/opt/app".to_string()).await;
    assert!(matches!(unknown, Err(FleetError::NotFound(_))));

    assert_ok!(register_instance(&harness.engine, host.id, "/opt/app".to_string()).await);
    let duplicate = register_instance(&harness.engine, host.id, "/opt/app/".to_string()).await;
    assert!(matches!(duplicate, Err(FleetError::ValidationError(_))));
    harness.settle().await;
}

#[tokio::test]
async fn test_delete_host_removes_its_instances() {
    let harness = Harness::healthy();
    let doomed = harness.add_host("doomed").await;
    let kept = harness.add_host("kept").await;
    let a = harness.add_instance(&doomed, "/opt/a", "1.1");
    let b = harness.add_instance(&doomed, "/opt/b", "1.1");
    let c = harness.add_instance(&kept, "/opt/c", "1.1");

    let removed = delete_host(&harness.engine, doomed.id).await.unwrap();

    let mut removed: Vec<_> = removed.into_iter().map(|i| i.id).collect();
    removed.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(removed, expected);

    let instances = &harness.engine.store.instances;
    assert!(instances.get(&a.id).is_none());
    assert!(instances.get(&c.id).is_some());
    assert!(harness.inventory.host(&doomed.id).await.is_none());

    let again = delete_host(&harness.engine, doomed.id).await;
    assert!(matches!(again, Err(FleetError::NotFound(_))));
}

#[tokio::test]
async fn test_running_host_rollout_cannot_be_deleted() {
    // keep the instance unhealthy long enough to observe the running rollout
    let harness = Harness::new(
        ScriptedTransport::new(release_script),
        ScriptedHealth::always("DOWN"),
    );
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_host_rollout(&harness.engine, artifact.id, vec![instance.id], false).unwrap();
    let early = assert_err!(delete_host_rollout(&harness.engine, id));
    assert!(matches!(early, FleetError::ValidationError(_)));
    assert!(harness.engine.store.host_rollouts.get(&id).is_some());

    harness.settle().await;
    assert_ok!(delete_host_rollout(&harness.engine, id));
}

#[tokio::test]
async fn test_deleting_staged_rollout_detaches_operations() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let id = create_staged_rollout(&harness.engine, artifact.id, vec![instance.id]).unwrap();
    harness.settle().await;
    let issued = harness.engine.store.operations.len();
    assert!(issued > 0);

    assert_ok!(delete_staged_rollout(&harness.engine, id));

    assert!(harness.engine.store.staged_rollouts.get(&id).is_none());
    assert_eq!(harness.engine.store.operations.len(), issued);
    assert!(harness
        .engine
        .store
        .operations
        .find(|op| op.parent == Some(id))
        .is_empty());
}

#[tokio::test]
async fn test_rollout_creation_validates_targets() {
    let harness = Harness::healthy();
    let host = harness.add_host("web").await;
    let instance = harness.add_instance(&host, "/opt/app", "1.1");
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;

    let empty = create_staged_rollout(&harness.engine, artifact.id, vec![]);
    assert!(matches!(empty, Err(FleetError::ValidationError(_))));

    let unknown_artifact = create_host_rollout(&harness.engine, uuid::Uuid::new_v4(), vec![instance.id], false);
    assert!(matches!(unknown_artifact, Err(FleetError::NotFound(_))));

    let unknown_instance = create_staged_rollout(&harness.engine, artifact.id, vec![uuid::Uuid::new_v4()]);
    assert!(matches!(unknown_instance, Err(FleetError::NotFound(_))));

    assert!(harness.engine.store.staged_rollouts.is_empty());
    assert!(harness.engine.store.host_rollouts.is_empty());
}
