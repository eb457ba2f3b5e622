//! Acquisition broker: the entry point request handlers use.
//!
//! Resolves the target's pool through the registry, borrows a connection
//! with the caller's timeout (or the configured default), and owns the
//! reaper task so that shutdown stops it before draining the pools.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::{TargetConfig, TargetIdentity};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::error::{PoolError, PoolResult};
use crate::factory::{BoxFuture, ConnectionFactory};
use crate::reaper::Reaper;
use crate::registry::PoolRegistry;
use crate::stats::PoolStats;

pub struct ConnectionBroker<F: ConnectionFactory> {
    registry: Arc<PoolRegistry<F>>,
    reaper: Mutex<Option<Reaper>>,
}

impl<F: ConnectionFactory> ConnectionBroker<F> {
    /// Build the registry and start the idle reaper. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: PoolConfig, factory: Arc<F>) -> Self {
        let interval = config.reaper_interval;
        tracing::info!(
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            global_max_connections = config.global_max_connections,
            global_max_targets = config.global_max_targets,
            idle_timeout = ?config.idle_timeout,
            "connection broker starting"
        );
        let registry = Arc::new(PoolRegistry::new(config, factory));
        let reaper = Reaper::spawn(Arc::clone(&registry), interval);
        Self {
            registry,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry<F>> {
        &self.registry
    }

    pub fn config(&self) -> &PoolConfig {
        self.registry.config()
    }

    /// Borrow a connection for `target`.
    ///
    /// `timeout` defaults to `acquire_timeout_default`. If the target's pool
    /// is evicted while the caller waits, the pool is resolved again once;
    /// a second eviction is reported as [`PoolError::Exhausted`].
    pub async fn acquire(
        &self,
        target: &TargetConfig,
        timeout: Option<Duration>,
    ) -> PoolResult<PooledConnection<F>> {
        let timeout = timeout.unwrap_or(self.config().acquire_timeout_default);
        let started = Instant::now();
        let deadline = started + timeout;

        let pool = self.registry.resolve(target).await?;
        match pool.acquire(timeout).await {
            Err(PoolError::Evicted { .. }) => {}
            other => return other,
        }

        tracing::debug!(pool = %pool.identity(), "target pool evicted during acquire, resolving again");
        let pool = self.registry.resolve(target).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        pool.acquire(remaining).await.map_err(|err| match err {
            PoolError::Evicted { target } => PoolError::Exhausted {
                target,
                waited: started.elapsed(),
            },
            other => other,
        })
    }

    /// Return a connection to its pool. Equivalent to
    /// [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<F>) {
        conn.release().await;
    }

    /// Borrow a connection, run `work` with it and release it afterwards.
    ///
    /// If `work` fails the connection is health-checked and discarded when
    /// it no longer responds, so a dead socket is not handed to the next
    /// caller.
    pub async fn with_connection<T, E, W>(
        &self,
        target: &TargetConfig,
        timeout: Option<Duration>,
        work: W,
    ) -> Result<T, E>
    where
        W: for<'c> FnOnce(&'c mut PooledConnection<F>) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        let mut conn = self.acquire(target, timeout).await?;
        let result = work(&mut conn).await;
        if result.is_err() && !conn.is_broken() && !conn.check_health().await {
            tracing::debug!(
                pool = %conn.identity(),
                conn_id = conn.id(),
                "connection failed health check after error, discarding"
            );
            conn.mark_broken();
        }
        conn.release().await;
        result
    }

    /// Statistics for one target, or summed over every target when
    /// `identity` is `None`. Unknown targets yield `None`.
    pub fn pool_stats(&self, identity: Option<&TargetIdentity>) -> Option<PoolStats> {
        match identity {
            Some(identity) => self.registry.stats(identity),
            None => Some(self.registry.aggregate_stats()),
        }
    }

    /// Log statistics for every pool at info level.
    pub fn log_stats(&self) {
        for identity in self.registry.identities() {
            if let Some(stats) = self.registry.stats(&identity) {
                tracing::info!(
                    pool = %identity,
                    borrowed = stats.borrowed,
                    idle = stats.idle,
                    opening = stats.opening,
                    queued = stats.queued,
                    wait_count = stats.wait_count,
                    timeout_count = stats.timeout_count,
                    "pool statistics"
                );
            }
        }
        tracing::info!(
            pools = self.registry.len(),
            live = self.registry.total_connections(),
            max = self.registry.max_connections(),
            "global pool statistics"
        );
    }

    /// Stop the reaper, close every pool and wait up to `drain_timeout`
    /// for borrowed connections. Returns how many were still out.
    pub async fn shutdown(&self) -> usize {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        self.registry.shutdown(self.config().drain_timeout).await
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionBroker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
