//! Idle reaper: background task that trims stale idle connections and
//! drops pools left empty.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::factory::ConnectionFactory;
use crate::registry::PoolRegistry;

/// Handle to a running reaper task. Stopped explicitly by the broker on
/// shutdown, and aborted if dropped.
pub struct Reaper {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Reaper {
    /// Spawn the reaper loop on the current runtime.
    pub fn spawn<F: ConnectionFactory>(registry: Arc<PoolRegistry<F>>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_reaper_loop(registry, interval, shutdown_rx));
        info!(interval = ?interval, "idle reaper started");
        Self {
            handle: Some(handle),
            shutdown_tx,
        }
    }

    /// Signal the loop to stop and wait for it to finish its current pass.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("idle reaper stopped");
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_reaper_loop<F: ConnectionFactory>(
    registry: Arc<PoolRegistry<F>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = registry.reap_idle().await;
                debug!(
                    closed = report.closed,
                    removed = report.removed,
                    live = registry.total_connections(),
                    "reaper pass"
                );
            }
            _ = shutdown.changed() => {
                debug!("reaper loop shutting down");
                break;
            }
        }
    }
}
