//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::engine::Engine;
use crate::errors::FleetError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::snapshot;

/// Run the engine until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FleetError> {
    info!("Initializing fleetops engine...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start engine: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), FleetError> {
    let app_state = AppState::init(options).await?;
    info!("Loaded {}", app_state.summary().await);
    let engine = app_state.engine.clone();
    shutdown_manager.with_engine(engine.clone())?;

    init_snapshot_worker(options.snapshot.clone(), engine.clone(), shutdown_manager)?;

    if options.enable_server {
        init_server(options, engine, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_snapshot_worker(
    options: snapshot::Options,
    engine: Engine,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), FleetError> {
    info!("Initializing snapshot worker...");

    // Stopped separately so the last snapshot follows the queue drain
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        snapshot::run(
            &options,
            engine.store.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    shutdown_manager.with_snapshot_worker(stop_tx, handle)
}

async fn init_server(
    options: &AppOptions,
    engine: Engine,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing HTTP server...");

    let server_handle = serve(&options.server, Arc::new(ServerState::new(engine)), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct SnapshotWorker {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    engine: Option<Engine>,
    server_handle: Option<JoinHandle<Result<(), FleetError>>>,
    snapshot_worker: Option<SnapshotWorker>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            engine: None,
            server_handle: None,
            snapshot_worker: None,
        }
    }

    pub fn with_engine(&mut self, engine: Engine) -> Result<(), FleetError> {
        if self.engine.is_some() {
            return Err(FleetError::ShutdownError("engine already set".to_string()));
        }
        self.engine = Some(engine);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), FleetError>>,
    ) -> Result<(), FleetError> {
        if self.server_handle.is_some() {
            return Err(FleetError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub fn with_snapshot_worker(
        &mut self,
        stop_tx: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    ) -> Result<(), FleetError> {
        if self.snapshot_worker.is_some() {
            return Err(FleetError::ShutdownError("snapshot_worker already set".to_string()));
        }
        self.snapshot_worker = Some(SnapshotWorker { stop_tx, handle });
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FleetError> {
        info!("Shutting down fleetops engine...");
        let _ = self.shutdown_tx.send(());

        // 1. Server, so no new work arrives
        if let Some(handle) = self.server_handle.take() {
            handle.await??;
        }

        // 2. Queued work, bounded
        if let Some(engine) = self.engine.take() {
            let delay = self.lifecycle_options.max_shutdown_delay;
            if !engine.queue.drain(delay).await {
                warn!(
                    in_flight = engine.queue.in_flight(),
                    "Queued work still running after {:?}, abandoning it", delay
                );
            }
        }

        // 3. Snapshot worker writes the final snapshot
        if let Some(worker) = self.snapshot_worker.take() {
            let _ = worker.stop_tx.send(());
            worker.handle.await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
