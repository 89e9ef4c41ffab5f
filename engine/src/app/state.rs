//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::engine::Engine;
use crate::errors::FleetError;
use crate::health::ReqwestHealthClient;
use crate::inventory::{Inventory, MemoryInventory};
use crate::store::Store;
use crate::transport::TransportSet;

/// Main application state
pub struct AppState {
    /// Engine handle shared with the server and workers
    pub engine: Engine,

    /// Concrete inventory, kept for summaries
    pub inventory: Arc<MemoryInventory>,
}

impl AppState {
    /// Load persisted records and build the engine
    pub async fn init(options: &AppOptions) -> Result<Self, FleetError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let store = Arc::new(Store::load(&options.layout.state_file()).await?);
        let inventory = Arc::new(MemoryInventory::load(&options.layout.inventory_file()).await?);
        let transports = TransportSet::new(&options.transport)?;
        let health = Arc::new(ReqwestHealthClient::new(
            options.engine.health.request_timeout,
        )?);

        let engine = Engine::new(
            store,
            inventory.clone() as Arc<dyn Inventory>,
            transports,
            health,
            options.engine.clone(),
        );

        Ok(Self { engine, inventory })
    }

    /// One-line description of what was loaded
    pub async fn summary(&self) -> String {
        format!(
            "{} host(s), {} credential(s), {} instance(s), {} artifact(s), {} operation(s)",
            self.inventory.hosts().await.len(),
            self.inventory.credential_count().await,
            self.engine.store.instances.len(),
            self.engine.store.artifacts.len(),
            self.engine.store.operations.len(),
        )
    }
}
