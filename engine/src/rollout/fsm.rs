//! Stage table of the staged rollout
//!
//! Each stage builds one operation per surviving instance and validates the
//! finished operation before the instance may move on.

use crate::artifact::envfile::parse_env_lossy;
use crate::models::{
    Artifact, ExecProtocol, FileProtocol, FileSource, Instance, Operation, OperationKind, Stage,
};
use crate::rollout::commands;
use crate::rollout::RolloutOptions;

/// Inputs a stage needs for one instance
pub struct StageContext<'a> {
    pub instance: &'a Instance,
    pub artifact: &'a Artifact,
    pub options: &'a RolloutOptions,
}

impl StageContext<'_> {
    fn archive_path(&self) -> String {
        commands::staged_archive_path(
            &self.options.staging_dir,
            self.artifact.id,
            self.instance.id,
        )
    }

    fn execute(&self, commands: Vec<String>) -> OperationKind {
        OperationKind::ExecuteCommand {
            commands,
            protocol: ExecProtocol::Ssh,
            elevate: self.options.elevate,
        }
    }
}

pub struct StageDescriptor {
    pub stage: Stage,
    pub name: &'static str,
    /// Operation to run for one instance
    pub build: fn(&StageContext<'_>) -> OperationKind,
    /// Check a completed operation; `Err` carries the reason the instance is dropped
    pub validate: fn(&Operation, &StageContext<'_>) -> Result<(), String>,
    pub next: Option<Stage>,
}

pub static STAGES: [StageDescriptor; 3] = [
    StageDescriptor {
        stage: Stage::Distribute,
        name: "distribute artifact",
        build: build_distribute,
        validate: accept,
        next: Some(Stage::Prepare),
    },
    StageDescriptor {
        stage: Stage::Prepare,
        name: "unpack and prepare",
        build: build_prepare,
        validate: validate_prepare,
        next: Some(Stage::PullImages),
    },
    StageDescriptor {
        stage: Stage::PullImages,
        name: "pull images",
        build: build_pull_images,
        validate: validate_pull_images,
        next: None,
    },
];

pub const FIRST_STAGE: Stage = Stage::Distribute;

pub fn descriptor(stage: Stage) -> &'static StageDescriptor {
    let index = match stage {
        Stage::Distribute => 0,
        Stage::Prepare => 1,
        Stage::PullImages => 2,
    };
    &STAGES[index]
}

fn build_distribute(ctx: &StageContext<'_>) -> OperationKind {
    OperationKind::SendFile {
        protocol: FileProtocol::Sftp,
        source: FileSource::Artifact {
            id: ctx.artifact.id,
        },
        destination: ctx.archive_path(),
    }
}

fn accept(_op: &Operation, _ctx: &StageContext<'_>) -> Result<(), String> {
    Ok(())
}

fn build_prepare(ctx: &StageContext<'_>) -> OperationKind {
    ctx.execute(commands::prepare(ctx.instance, &ctx.archive_path()))
}

/// The unpacked `version.env` must describe the artifact being rolled out
fn validate_prepare(op: &Operation, ctx: &StageContext<'_>) -> Result<(), String> {
    let params = parse_env_lossy(&op.stdout_for(ctx.instance.host));
    let branch = params.get("BRANCH").map(String::as_str).unwrap_or_default();
    let tag = params.get("TAG").map(String::as_str).unwrap_or_default();

    if branch != ctx.artifact.version || tag != ctx.artifact.tag {
        return Err(format!(
            "unpacked release is {}/{}, expected {}/{}",
            or_missing(branch),
            or_missing(tag),
            ctx.artifact.version,
            ctx.artifact.tag
        ));
    }
    Ok(())
}

fn or_missing(value: &str) -> &str {
    if value.is_empty() {
        "<missing>"
    } else {
        value
    }
}

fn build_pull_images(ctx: &StageContext<'_>) -> OperationKind {
    ctx.execute(commands::pull_images(ctx.instance))
}

/// Every image the release references must be present after the pull
fn validate_pull_images(op: &Operation, ctx: &StageContext<'_>) -> Result<(), String> {
    let count = |index: usize| -> Option<u64> {
        op.output
            .iter()
            .rev()
            .find(|r| r.host == ctx.instance.host && r.command_index == index)
            .and_then(|r| r.stdout.trim().parse().ok())
    };

    match (
        count(commands::EXPECTED_IMAGES_INDEX),
        count(commands::PULLED_IMAGES_INDEX),
    ) {
        (Some(0), _) => Err("release references no images".to_string()),
        (Some(expected), Some(pulled)) if expected == pulled => Ok(()),
        (Some(expected), Some(pulled)) => {
            Err(format!("{pulled} of {expected} images present after pull"))
        }
        _ => Err("could not read image counts".to_string()),
    }
}
