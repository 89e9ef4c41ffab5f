//! Server state

use tokio::time::Instant;

use crate::engine::Engine;

/// Server state shared across handlers
pub struct ServerState {
    pub engine: Engine,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }
}
