//! Hosts and the credentials used to reach them

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::models::{Credential, CredentialKind, Host};

/// Inventory lookups, as a trait for testability
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn host(&self, id: &Uuid) -> Option<Host>;

    async fn hosts(&self) -> Vec<Host>;

    /// First credential of `kind` attached to `host`
    async fn resolve_credential(&self, host: &Host, kind: CredentialKind)
        -> Option<Arc<Credential>>;

    /// Forget a host and detach it from its credentials
    async fn remove_host(&self, id: &Uuid) -> Option<Host>;
}

/// Credential as written in the inventory file
#[derive(Debug, Deserialize)]
struct CredentialEntry {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    kind: CredentialKind,
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    ssh_key: Option<PathBuf>,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    ssl: bool,
    #[serde(default)]
    hosts: Vec<Uuid>,
}

impl From<CredentialEntry> for Credential {
    fn from(entry: CredentialEntry) -> Self {
        Credential {
            id: entry.id,
            kind: entry.kind,
            username: entry.username,
            password: SecretString::from(entry.password),
            port: entry.port,
            ssh_key: entry.ssh_key,
            passphrase: entry.passphrase.map(SecretString::from),
            ssl: entry.ssl,
            hosts: entry.hosts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    credentials: Vec<CredentialEntry>,
}

/// In-memory inventory, optionally loaded from `inventory.json`
#[derive(Default)]
pub struct MemoryInventory {
    hosts: RwLock<Vec<Host>>,
    credentials: RwLock<Vec<Arc<Credential>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load hosts and credentials from a JSON file; a missing file yields an empty inventory
    pub async fn load(file: &File) -> Result<Self, FleetError> {
        if !file.exists().await {
            info!("No inventory at {}, starting empty", file.path().display());
            return Ok(Self::new());
        }

        let parsed: InventoryFile = file.read_json().await?;
        let inventory = Self::new();
        for host in parsed.hosts {
            inventory.add_host(host).await;
        }
        for entry in parsed.credentials {
            inventory.add_credential(entry.into()).await?;
        }
        info!(
            hosts = inventory.hosts.read().await.len(),
            credentials = inventory.credentials.read().await.len(),
            "Loaded inventory from {}",
            file.path().display()
        );
        Ok(inventory)
    }

    pub async fn add_host(&self, host: Host) {
        let mut hosts = self.hosts.write().await;
        hosts.retain(|h| h.id != host.id);
        hosts.push(host);
    }

    /// Register a credential; every host it names must already be known
    pub async fn add_credential(&self, credential: Credential) -> Result<(), FleetError> {
        let hosts = self.hosts.read().await;
        if let Some(unknown) = credential
            .hosts
            .iter()
            .find(|id| !hosts.iter().any(|h| &h.id == *id))
        {
            return Err(FleetError::ConfigError(format!(
                "credential {} references unknown host {}",
                credential.id, unknown
            )));
        }
        drop(hosts);

        self.credentials.write().await.push(Arc::new(credential));
        Ok(())
    }

    pub async fn credential_count(&self) -> usize {
        self.credentials.read().await.len()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn host(&self, id: &Uuid) -> Option<Host> {
        self.hosts.read().await.iter().find(|h| &h.id == id).cloned()
    }

    async fn hosts(&self) -> Vec<Host> {
        self.hosts.read().await.clone()
    }

    async fn resolve_credential(
        &self,
        host: &Host,
        kind: CredentialKind,
    ) -> Option<Arc<Credential>> {
        let credentials = self.credentials.read().await;
        let found = credentials
            .iter()
            .find(|c| c.kind == kind && c.hosts.contains(&host.id))
            .cloned();
        if found.is_none() {
            debug!("No {} credential for host {}", kind, host.name);
        }
        found
    }

    async fn remove_host(&self, id: &Uuid) -> Option<Host> {
        let mut hosts = self.hosts.write().await;
        let index = hosts.iter().position(|h| &h.id == id)?;
        let removed = hosts.remove(index);
        drop(hosts);

        // credentials are Arc-shared with running sessions; rebuild instead of mutating
        let mut credentials = self.credentials.write().await;
        *credentials = credentials
            .iter()
            .map(|c| {
                if !c.hosts.contains(id) {
                    return c.clone();
                }
                Arc::new(Credential {
                    id: c.id,
                    kind: c.kind,
                    username: c.username.clone(),
                    password: clone_secret(&c.password),
                    port: c.port,
                    ssh_key: c.ssh_key.clone(),
                    passphrase: c.passphrase.as_ref().map(clone_secret),
                    ssl: c.ssl,
                    hosts: c.hosts.iter().filter(|h| *h != id).copied().collect(),
                })
            })
            .collect();

        Some(removed)
    }
}

fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
