//! Utility functions

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Build metadata reported by `--version` and `/version`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Exponential backoff between poll attempts
#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per attempt; values below 1 are treated as 1
    pub multiplier: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            multiplier: 1.5,
        }
    }
}

/// Delay before retrying after `attempt` (zero-based), capped at `max_delay`
pub fn backoff_delay(options: &BackoffOptions, attempt: u32) -> Duration {
    let factor = options
        .multiplier
        .max(1.0)
        .powi(attempt.min(i32::MAX as u32) as i32);
    let delay = options.base_delay.as_secs_f64() * factor;
    if !delay.is_finite() {
        return options.max_delay;
    }
    Duration::from_secs_f64(delay.min(options.max_delay.as_secs_f64()))
}

/// Hex SHA-256 of a file, streamed. Blocking.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
