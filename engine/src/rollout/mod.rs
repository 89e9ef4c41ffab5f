//! Release rollouts
//!
//! Two workflows share the command builders in [`commands`]:
//!
//! - [`staged`] prepares instances through the stage table in [`fsm`],
//!   pruning instances that fail a stage.
//! - [`host`] updates instances host by host, one concurrent workflow per host.

pub mod commands;
pub mod fsm;
pub mod host;
pub mod staged;

use std::time::Duration;

/// Rollout settings
#[derive(Debug, Clone)]
pub struct RolloutOptions {
    /// Minimum free space in KiB the host workflow requires before transferring
    pub min_free_space_kb: u64,

    /// Fixed path the host workflow transfers the archive to
    pub remote_artifact_path: String,

    /// Directory staged rollouts distribute archives into
    pub staging_dir: String,

    /// Versions containing this marker form their own update class
    pub anonymous_marker: String,

    /// Run rollout commands through sudo
    pub elevate: bool,

    /// Pause between registering an instance and reading its introspection result
    pub introspection_delay: Duration,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            min_free_space_kb: 5 * 1024 * 1024,
            remote_artifact_path: "/tmp/fleetops-release.tar.gz".to_string(),
            staging_dir: "/tmp".to_string(),
            anonymous_marker: "anonymous".to_string(),
            elevate: false,
            introspection_delay: Duration::from_secs(2),
        }
    }
}
