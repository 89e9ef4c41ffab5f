//! Application health probe

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::errors::FleetError;

/// Status value a healthy application reports
pub const STATUS_UP: &str = "UP";

#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// Path appended to the instance's base URL
    pub path: String,
    /// Pause between probes
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
    /// Budget of a single HTTP request
    pub request_timeout: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            path: "/actuator/health".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Health endpoint client, as a trait for testability
#[async_trait]
pub trait HealthClient: Send + Sync {
    /// Value of the `status` field reported at `url`
    async fn status(&self, url: &Url) -> Result<String, FleetError>;
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

pub struct ReqwestHealthClient {
    client: Client,
}

impl ReqwestHealthClient {
    pub fn new(request_timeout: Duration) -> Result<Self, FleetError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthClient for ReqwestHealthClient {
    async fn status(&self, url: &Url) -> Result<String, FleetError> {
        // a DOWN application usually answers 503 with a body, so the code is not checked
        let response = self.client.get(url.clone()).send().await?;
        let body: HealthBody = response.json().await?;
        Ok(body.status)
    }
}

/// Health URL of an application rooted at `base`
pub fn health_url(base: &str, path: &str) -> Result<Url, FleetError> {
    let base = Url::parse(base)
        .map_err(|e| FleetError::ValidationError(format!("invalid base url {base}: {e}")))?;
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined)
        .map_err(|e| FleetError::ValidationError(format!("invalid health url {joined}: {e}")))
}

/// Probe `url` every `interval` until it reports UP or `timeout` passes
pub async fn wait_healthy(
    client: &dyn HealthClient,
    url: &Url,
    interval: Duration,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut probes = 0u32;

    loop {
        probes += 1;
        match client.status(url).await {
            Ok(status) if status == STATUS_UP => {
                debug!("{} is healthy after {} probe(s)", url, probes);
                return true;
            }
            Ok(status) => debug!("{} reported {}", url, status),
            Err(e) => debug!("Health probe of {} failed: {}", url, e),
        }

        let now = Instant::now();
        if now + interval > deadline {
            warn!("{} not healthy after {} probe(s) in {:?}", url, probes, timeout);
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
