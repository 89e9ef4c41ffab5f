//! Periodic store snapshot worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::filesys::file::File;
use crate::store::Store;

/// Snapshot worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between snapshots
    pub interval: Duration,

    /// Where snapshots are written
    pub state_file: File,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            state_file: File::new("/var/lib/fleetops/state.json"),
        }
    }
}

/// Run the snapshot worker until `shutdown_signal` resolves. A last snapshot
/// is written on the way out.
pub async fn run<S, F>(
    options: &Options,
    store: &Store,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Snapshot worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Snapshot worker shutting down...");
                break;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match store.save(&options.state_file).await {
            Ok(()) => debug!("Snapshot written to {}", options.state_file.path().display()),
            Err(e) => error!("Snapshot failed: {}", e),
        }
    }

    if let Err(e) = store.save(&options.state_file).await {
        error!("Final snapshot failed: {}", e);
    }
}
