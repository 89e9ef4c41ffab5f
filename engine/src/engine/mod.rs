//! Engine handle shared by every task
//!
//! Bundles the store, the inventory, transports, the health client and the
//! task queue. Cloning is cheap; clones share everything.

pub mod triggers;

use std::sync::Arc;

use crate::artifact::ArtifactOptions;
use crate::health::{HealthClient, HealthOptions};
use crate::inventory::Inventory;
use crate::ops::poll::PollOptions;
use crate::ops::queue::TaskQueue;
use crate::rollout::RolloutOptions;
use crate::store::Store;
use crate::transport::TransportSet;

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub poll: PollOptions,
    pub health: HealthOptions,
    pub rollout: RolloutOptions,
    pub artifact: ArtifactOptions,
}

#[derive(Clone)]
pub struct Engine {
    pub store: Arc<Store>,
    pub inventory: Arc<dyn Inventory>,
    pub transports: Arc<TransportSet>,
    pub health: Arc<dyn HealthClient>,
    pub queue: TaskQueue,
    pub options: Arc<EngineOptions>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        inventory: Arc<dyn Inventory>,
        transports: TransportSet,
        health: Arc<dyn HealthClient>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            inventory,
            transports: Arc::new(transports),
            health,
            queue: TaskQueue::new(),
            options: Arc::new(options),
        }
    }
}
