//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily log files under the storage layout
    #[serde(default)]
    pub log_to_file: bool,

    /// Trigger/read HTTP surface
    #[serde(default)]
    pub server: ServerSettings,

    /// Operation polling
    #[serde(default)]
    pub poll: PollSettings,

    /// Instance health probing
    #[serde(default)]
    pub health: HealthSettings,

    /// Remote transports
    #[serde(default)]
    pub transport: TransportSettings,

    /// Rollout behaviour
    #[serde(default)]
    pub rollout: RolloutSettings,

    /// Artifact validation
    #[serde(default)]
    pub artifact: ArtifactSettings,

    /// Seconds between store snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Upper bound for draining queued work at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            server: ServerSettings::default(),
            poll: PollSettings::default(),
            health: HealthSettings::default(),
            transport: TransportSettings::default(),
            rollout: RolloutSettings::default(),
            artifact: ArtifactSettings::default(),
            snapshot_interval_secs: default_snapshot_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Poll-retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Absolute bound on one poll loop
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    120
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_poll_timeout() -> u64 {
    3600
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            timeout_secs: default_poll_timeout(),
        }
    }
}

/// Health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_health_path() -> String {
    "/actuator/health".to_string()
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    300
}

fn default_health_request_timeout() -> u64 {
    10
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            request_timeout_secs: default_health_request_timeout(),
        }
    }
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    900
}

fn default_transfer_timeout() -> u64 {
    1800
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

/// Rollout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSettings {
    /// Minimum free space on the target filesystem, in KiB
    #[serde(default = "default_min_free_space")]
    pub min_free_space_kb: u64,

    #[serde(default = "default_remote_artifact_path")]
    pub remote_artifact_path: String,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Versions containing this marker form their own update class
    #[serde(default = "default_anonymous_marker")]
    pub anonymous_marker: String,

    #[serde(default)]
    pub elevate: bool,

    #[serde(default = "default_introspection_delay")]
    pub introspection_delay_secs: u64,
}

fn default_min_free_space() -> u64 {
    5 * 1024 * 1024
}

fn default_remote_artifact_path() -> String {
    "/tmp/fleetops-release.tar.gz".to_string()
}

fn default_staging_dir() -> String {
    "/tmp".to_string()
}

fn default_anonymous_marker() -> String {
    "anonymous".to_string()
}

fn default_introspection_delay() -> u64 {
    2
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            min_free_space_kb: default_min_free_space(),
            remote_artifact_path: default_remote_artifact_path(),
            staging_dir: default_staging_dir(),
            anonymous_marker: default_anonymous_marker(),
            elevate: false,
            introspection_delay_secs: default_introspection_delay(),
        }
    }
}

/// Archive validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSettings {
    #[serde(default = "default_required_markers")]
    pub required_markers: Vec<String>,

    #[serde(default = "default_forbidden_markers")]
    pub forbidden_markers: Vec<String>,

    #[serde(default = "default_metadata_marker")]
    pub metadata_marker: String,
}

fn default_required_markers() -> Vec<String> {
    vec!["version.env".to_string(), "jetalon.env".to_string()]
}

fn default_forbidden_markers() -> Vec<String> {
    vec!["stand.env".to_string()]
}

fn default_metadata_marker() -> String {
    "version.env".to_string()
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            required_markers: default_required_markers(),
            forbidden_markers: default_forbidden_markers(),
            metadata_marker: default_metadata_marker(),
        }
    }
}
