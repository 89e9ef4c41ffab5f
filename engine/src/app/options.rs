//! Application configuration options

use std::time::Duration;

use crate::artifact::ArtifactOptions;
use crate::engine::EngineOptions;
use crate::health::HealthOptions;
use crate::logs::LogOptions;
use crate::ops::poll::PollOptions;
use crate::rollout::RolloutOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::transport::TransportOptions;
use crate::utils::BackoffOptions;
use crate::workers::snapshot;

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Logging configuration
    pub logging: LogOptions,

    /// Enable the trigger/read HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Engine timing and rollout behaviour
    pub engine: EngineOptions,

    /// Remote transport timeouts
    pub transport: TransportOptions,

    /// Snapshot worker options
    pub snapshot: snapshot::Options,
}

impl AppOptions {
    /// Derive runtime options from the settings file
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let logging = LogOptions {
            log_level: settings.log_level.clone(),
            stdout: true,
            file: settings.log_to_file,
            log_dir: layout.logs_dir().path().to_path_buf(),
            json_format: settings.json_logs,
        };

        let engine = EngineOptions {
            poll: PollOptions {
                max_attempts: settings.poll.max_attempts,
                backoff: BackoffOptions {
                    base_delay: Duration::from_millis(settings.poll.base_delay_ms),
                    max_delay: Duration::from_millis(settings.poll.max_delay_ms),
                    multiplier: settings.poll.multiplier,
                },
                timeout: Duration::from_secs(settings.poll.timeout_secs),
            },
            health: HealthOptions {
                path: settings.health.path.clone(),
                interval: Duration::from_secs(settings.health.interval_secs),
                timeout: Duration::from_secs(settings.health.timeout_secs),
                request_timeout: Duration::from_secs(settings.health.request_timeout_secs),
            },
            rollout: RolloutOptions {
                min_free_space_kb: settings.rollout.min_free_space_kb,
                remote_artifact_path: settings.rollout.remote_artifact_path.clone(),
                staging_dir: settings.rollout.staging_dir.clone(),
                anonymous_marker: settings.rollout.anonymous_marker.clone(),
                elevate: settings.rollout.elevate,
                introspection_delay: Duration::from_secs(settings.rollout.introspection_delay_secs),
            },
            artifact: ArtifactOptions {
                storage_dir: layout.artifacts_dir().path().to_path_buf(),
                required_markers: settings.artifact.required_markers.clone(),
                forbidden_markers: settings.artifact.forbidden_markers.clone(),
                metadata_marker: settings.artifact.metadata_marker.clone(),
            },
        };

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.shutdown_grace_secs),
            },
            logging,
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            engine,
            transport: TransportOptions {
                connect_timeout: Duration::from_secs(settings.transport.connect_timeout_secs),
                command_timeout: Duration::from_secs(settings.transport.command_timeout_secs),
                transfer_timeout: Duration::from_secs(settings.transport.transfer_timeout_secs),
            },
            snapshot: snapshot::Options {
                interval: Duration::from_secs(settings.snapshot_interval_secs.max(1)),
                state_file: layout.state_file(),
            },
            layout,
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum time to wait for queued work at shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
