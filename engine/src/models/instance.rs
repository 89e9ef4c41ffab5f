//! Deployed application instances

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How docker compose is invoked on the instance's host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeVariant {
    /// `docker compose`
    #[default]
    Plugin,
    /// `docker-compose`
    Standalone,
}

impl ComposeVariant {
    pub fn command(&self) -> &'static str {
        match self {
            ComposeVariant::Plugin => "docker compose",
            ComposeVariant::Standalone => "docker-compose",
        }
    }
}

/// An application deployment living in one directory on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub host: Uuid,

    /// Absolute directory of the deployment on the host
    pub path: String,

    /// Base URL of the running application
    #[serde(default)]
    pub url: String,

    /// Release version (BRANCH)
    #[serde(default)]
    pub version: String,

    /// Release tag (TAG)
    #[serde(default)]
    pub tag: String,

    /// Stand (environment) name
    #[serde(default)]
    pub stand: String,

    #[serde(default)]
    pub compose: ComposeVariant,

    /// Introspection succeeded
    #[serde(default)]
    pub is_valid: bool,

    /// Why the instance is not valid, once that is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,

    /// A staged rollout finished preparing this instance
    #[serde(default)]
    pub ready_to_update: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(host: Uuid, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            host,
            path: path.into(),
            url: String::new(),
            version: String::new(),
            tag: String::new(),
            stand: String::new(),
            compose: ComposeVariant::default(),
            is_valid: false,
            invalid_reason: None,
            ready_to_update: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Populate derived state from introspection output and return `is_valid`
    pub fn apply_params(&mut self, params: &BTreeMap<String, String>) -> bool {
        let get = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

        let version = get("BRANCH");
        let tag = get("TAG");
        let url = get("URL");

        self.stand = get("STAND").unwrap_or_default();
        self.compose = match params.get("COMPOSE").map(String::as_str) {
            Some("standalone") => ComposeVariant::Standalone,
            _ => ComposeVariant::Plugin,
        };

        let missing: Vec<&str> = [("BRANCH", &version), ("TAG", &tag), ("URL", &url)]
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| *key)
            .collect();
        self.is_valid = missing.is_empty();
        self.invalid_reason = (!self.is_valid)
            .then(|| format!("introspection did not report {}", missing.join(", ")));
        self.version = version.unwrap_or_default();
        self.tag = tag.unwrap_or_default();
        self.url = url.unwrap_or_default();
        self.updated_at = Utc::now();
        self.is_valid
    }
}
