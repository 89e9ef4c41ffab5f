//! Release archive ingestion

use std::path::Path;

use fleetops::engine::triggers::{delete_artifact, ingest_artifact};
use fleetops::errors::FleetError;

use crate::common::{write_archive, Harness};

fn stored_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .map(|path| if path.is_dir() { stored_files(&path) } else { 1 })
        .sum()
}

#[tokio::test]
async fn test_accepts_release_archive() {
    let harness = Harness::healthy();
    let archive = write_archive(
        harness.dir.path(),
        "release 1.2.tar.gz",
        &[
            ("./version.env", "# release\nBRANCH=1.2\nTAG=stable\n"),
            ("./jetalon.env", "JAVA_OPTS=-Xmx1g\n"),
            ("./docker-compose.yml", "services: {}\n"),
        ],
    );

    let artifact = ingest_artifact(&harness.engine, archive, None).await.unwrap();

    assert_eq!(artifact.version, "1.2");
    assert_eq!(artifact.tag, "stable");
    assert_eq!(artifact.file_name, "release_1.2.tar.gz");
    assert_eq!(artifact.sha256.len(), 64);
    assert!(artifact.file.exists());
    assert!(artifact.file.starts_with(harness.dir.path().join("artifacts")));
    assert!(harness.engine.store.artifacts.get(&artifact.id).is_some());
}

#[tokio::test]
async fn test_rejects_archive_missing_a_marker() {
    let harness = Harness::healthy();
    let archive = write_archive(
        harness.dir.path(),
        "release.tar.gz",
        &[("version.env", "BRANCH=1.2\nTAG=stable\n")],
    );

    let result = ingest_artifact(&harness.engine, archive, None).await;

    match result {
        Err(FleetError::ArtifactInvalid(message)) => assert!(message.contains("jetalon.env")),
        other => panic!("expected ArtifactInvalid, got {other:?}"),
    }
    assert!(harness.engine.store.artifacts.is_empty());
    assert_eq!(stored_files(&harness.dir.path().join("artifacts")), 0);
}

#[tokio::test]
async fn test_rejects_archive_carrying_stand_configuration() {
    let harness = Harness::healthy();
    let archive = write_archive(
        harness.dir.path(),
        "release.tar.gz",
        &[
            ("version.env", "BRANCH=1.2\nTAG=stable\n"),
            ("jetalon.env", ""),
            ("stand.env", "STAND=prod\n"),
        ],
    );

    let result = ingest_artifact(&harness.engine, archive, None).await;

    assert!(matches!(result, Err(FleetError::ArtifactInvalid(_))));
    assert!(harness.engine.store.artifacts.is_empty());
    assert_eq!(stored_files(&harness.dir.path().join("artifacts")), 0);
}

#[tokio::test]
async fn test_rejects_metadata_without_tag() {
    let harness = Harness::healthy();
    let archive = write_archive(
        harness.dir.path(),
        "release.tar.gz",
        &[("version.env", "BRANCH=1.2\n"), ("jetalon.env", "")],
    );

    let result = ingest_artifact(&harness.engine, archive, None).await;

    match result {
        Err(FleetError::ArtifactInvalid(message)) => assert!(message.contains("TAG")),
        other => panic!("expected ArtifactInvalid, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejects_file_that_is_not_an_archive() {
    let harness = Harness::healthy();
    let path = harness.dir.path().join("notes.tar.gz");
    std::fs::write(&path, "plain text").unwrap();

    let result = ingest_artifact(&harness.engine, path, Some("notes.tar.gz".to_string())).await;

    assert!(matches!(result, Err(FleetError::ArtifactInvalid(_))));
    assert_eq!(stored_files(&harness.dir.path().join("artifacts")), 0);
}

#[tokio::test]
async fn test_delete_removes_stored_file() {
    let harness = Harness::healthy();
    let artifact = harness.add_artifact("BRANCH=1.2\nTAG=stable\n").await;
    assert!(artifact.file.exists());

    delete_artifact(&harness.engine, artifact.id).await.unwrap();

    assert!(!artifact.file.exists());
    // the emptied month directory goes too
    assert!(!artifact.file.parent().unwrap().exists());
    assert!(harness.dir.path().join("artifacts").exists());
    assert!(harness.engine.store.artifacts.get(&artifact.id).is_none());
    let again = delete_artifact(&harness.engine, artifact.id).await;
    assert!(matches!(again, Err(FleetError::NotFound(_))));
}
