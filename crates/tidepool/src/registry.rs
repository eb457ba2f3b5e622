//! Target pool registry with LRU eviction.
//!
//! Maps each [`TargetIdentity`] to its [`TargetPool`]. Pools are created on
//! first use; once `global_max_targets` pools exist, admitting a new target
//! force-closes the least recently used one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::{TargetConfig, TargetIdentity};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::GlobalBudget;
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::factory::ConnectionFactory;
use crate::pool::TargetPool;
use crate::stats::PoolStats;

/// Result of one reaper pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Idle connections closed.
    pub closed: usize,
    /// Drained pools removed from the registry.
    pub removed: usize,
}

/// Registry of target pools sharing one factory and one global budget.
pub struct PoolRegistry<F: ConnectionFactory> {
    pools: Mutex<HashMap<TargetIdentity, Arc<TargetPool<F>>>>,
    budget: Arc<GlobalBudget<F>>,
    factory: Arc<F>,
    config: PoolConfig,
    shutting_down: AtomicBool,
}

impl<F: ConnectionFactory> PoolRegistry<F> {
    pub fn new(config: PoolConfig, factory: Arc<F>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            budget: Arc::new(GlobalBudget::new(config.global_max_connections)),
            factory,
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Return the pool for `target`, creating it if needed.
    ///
    /// If the registry is full, the least recently touched pool (ties go to
    /// the older pool) is evicted first. Its idle connections are closed,
    /// queued callers get [`PoolError::Evicted`] and borrowed connections
    /// are closed when they come back. Eviction never fails the caller.
    pub async fn resolve(&self, target: &TargetConfig) -> PoolResult<Arc<TargetPool<F>>> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        let identity = target.identity();

        let (pool, victim) = {
            let mut pools = self.pools.lock();
            // Set under this lock by `shutdown`, so no pool slips in after
            // the map has been drained.
            if self.is_shutting_down() {
                return Err(PoolError::ShuttingDown);
            }
            if let Some(pool) = pools.get(&identity) {
                pool.touch();
                return Ok(Arc::clone(pool));
            }

            let victim = if pools.len() >= self.config.global_max_targets {
                let lru = pools
                    .iter()
                    .min_by_key(|(_, pool)| pool.lru_key())
                    .map(|(id, _)| id.clone());
                lru.and_then(|id| pools.remove(&id))
            } else {
                None
            };

            let pool = TargetPool::new(
                target.clone(),
                &self.config,
                Arc::clone(&self.factory),
                Arc::clone(&self.budget),
            );
            pools.insert(identity, Arc::clone(&pool));
            (pool, victim)
        };

        debug!(pool = %pool.identity(), "created target pool");

        if let Some(victim) = victim {
            info!(
                evicted = %victim.identity(),
                admitted = %pool.identity(),
                max_targets = self.config.global_max_targets,
                "evicting least recently used target pool"
            );
            victim.evict().await;
        }

        Ok(pool)
    }

    pub fn get(&self, identity: &TargetIdentity) -> Option<Arc<TargetPool<F>>> {
        self.pools.lock().get(identity).cloned()
    }

    /// Refresh a pool's last-activity time. Returns `false` if unknown.
    pub fn touch(&self, identity: &TargetIdentity) -> bool {
        match self.pools.lock().get(identity) {
            Some(pool) => {
                pool.touch();
                true
            }
            None => false,
        }
    }

    /// Drop a pool that has fully drained. Pools that still hold or are
    /// opening connections stay registered.
    pub fn remove(&self, identity: &TargetIdentity) -> bool {
        let mut pools = self.pools.lock();
        let drained = pools
            .get(identity)
            .is_some_and(|pool| pool.retire_if_drained());
        if drained {
            pools.remove(identity);
            debug!(pool = %identity, "removed drained target pool");
        }
        drained
    }

    /// Live connections across every pool, including evicted ones still
    /// waiting for borrowed connections to come back.
    pub fn total_connections(&self) -> usize {
        self.budget.live()
    }

    pub fn max_connections(&self) -> usize {
        self.budget.max()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    pub fn identities(&self) -> Vec<TargetIdentity> {
        let mut ids: Vec<_> = self.pools.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn snapshot(&self) -> Vec<Arc<TargetPool<F>>> {
        self.pools.lock().values().cloned().collect()
    }

    pub fn stats(&self, identity: &TargetIdentity) -> Option<PoolStats> {
        self.get(identity).map(|pool| pool.stats())
    }

    /// Counters summed over all registered pools.
    pub fn aggregate_stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for pool in self.snapshot() {
            total.merge(&pool.stats());
        }
        total
    }

    /// One reaper pass: close stale idle connections, then remove pools
    /// left with nothing in them.
    pub async fn reap_idle(&self) -> ReapReport {
        let mut report = ReapReport::default();
        for pool in self.snapshot() {
            report.closed += pool.reap_idle(self.config.idle_timeout).await;
            if self.remove(pool.identity()) {
                report.removed += 1;
            }
        }
        if report.closed > 0 || report.removed > 0 {
            info!(
                closed = report.closed,
                removed = report.removed,
                remaining_pools = self.len(),
                "idle reaper pass complete"
            );
        }
        report
    }

    /// Stop admitting callers, close every pool and wait up to
    /// `drain_timeout` for borrowed connections to come back.
    ///
    /// Returns how many connections were still outstanding at the deadline,
    /// counting pools evicted earlier whose borrowers have not returned yet.
    /// Those are closed by their borrowers when released.
    pub async fn shutdown(&self, drain_timeout: Duration) -> usize {
        let pools: Vec<_> = {
            let mut pools = self.pools.lock();
            self.shutting_down.store(true, Ordering::SeqCst);
            pools.drain().map(|(_, pool)| pool).collect()
        };
        info!(drain_timeout = ?drain_timeout, "pool registry shutting down");

        for pool in &pools {
            pool.shutdown().await;
        }
        drop(pools);

        let deadline = Instant::now() + drain_timeout;
        let poll_interval = Duration::from_millis(50);
        let outstanding = loop {
            let outstanding: usize = self
                .budget
                .members()
                .iter()
                .map(|pool| pool.outstanding())
                .sum();
            if outstanding == 0 {
                info!("all borrowed connections returned");
                break 0;
            }
            if Instant::now() >= deadline {
                warn!(
                    outstanding = outstanding,
                    "drain timeout expired with connections still borrowed"
                );
                break outstanding;
            }
            tokio::time::sleep(poll_interval).await;
        };

        info!(outstanding = outstanding, "pool registry shutdown complete");
        outstanding
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PoolRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .field("pools", &self.len())
            .field("live", &self.budget.live())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFactory, config, factory, target};

    const WAIT: Duration = Duration::from_secs(5);

    fn registry(max_targets: usize) -> (PoolRegistry<MockFactory>, Arc<MockFactory>) {
        let factory = factory();
        let mut cfg = config(2, 1);
        cfg.global_max_targets = max_targets;
        (PoolRegistry::new(cfg, Arc::clone(&factory)), factory)
    }

    #[tokio::test]
    async fn resolve_reuses_pool_for_same_identity() {
        let (registry, _) = registry(4);
        let a = registry.resolve(&target("db1")).await.unwrap();
        let b = registry.resolve(&target("DB1 ")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn different_credentials_get_separate_pools() {
        let (registry, _) = registry(4);
        registry.resolve(&target("db1").with_password("a")).await.unwrap();
        registry.resolve(&target("db1").with_password("b")).await.unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_pool_is_evicted() {
        let (registry, _) = registry(3);
        for host in ["a", "b", "c"] {
            registry.resolve(&target(host)).await.unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        // Touching "a" makes "b" the oldest.
        assert!(registry.touch(&target("a").identity()));
        tokio::time::advance(Duration::from_millis(10)).await;

        registry.resolve(&target("d")).await.unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.get(&target("b").identity()).is_none());
        assert!(registry.get(&target("a").identity()).is_some());
        assert!(registry.get(&target("d").identity()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn lru_ties_go_to_the_older_pool() {
        let (registry, _) = registry(2);
        let first = registry.resolve(&target("first")).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        let second = registry.resolve(&target("second")).await.unwrap();
        // Same last activity, different creation times.
        first.touch();
        second.touch();

        registry.resolve(&target("third")).await.unwrap();
        assert!(registry.get(first.identity()).is_none());
        assert!(registry.get(second.identity()).is_some());
    }

    #[tokio::test]
    async fn eviction_marks_borrowed_connections_for_close() {
        let (registry, factory) = registry(1);
        let first = registry.resolve(&target("first")).await.unwrap();
        let conn = first.acquire(WAIT).await.unwrap();
        let serial = conn.serial;

        let second = registry.resolve(&target("second")).await.unwrap();
        assert_eq!(registry.identities(), vec![second.identity().clone()]);
        assert!(second.acquire(WAIT).await.is_ok());

        conn.release().await;
        assert!(factory.closed().contains(&serial));
        assert_eq!(first.idle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_pass_closes_stale_idle_and_removes_empty_pools() {
        let (registry, factory) = registry(4);
        let quiet = registry.resolve(&target("quiet")).await.unwrap();
        let busy = registry.resolve(&target("busy")).await.unwrap();
        quiet.acquire(WAIT).await.unwrap().release().await;
        let held = busy.acquire(WAIT).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = registry.reap_idle().await;

        assert_eq!(report, ReapReport { closed: 1, removed: 1 });
        assert_eq!(factory.closed().len(), 1);
        assert!(registry.get(quiet.identity()).is_none());
        assert_eq!(registry.identities(), vec![busy.identity().clone()]);
        assert_eq!(registry.total_connections(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn remove_keeps_pools_with_connections() {
        let (registry, _) = registry(4);
        let pool = registry.resolve(&target("db1")).await.unwrap();
        pool.acquire(WAIT).await.unwrap().release().await;
        assert!(!registry.remove(pool.identity()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn aggregate_stats_cover_every_pool() {
        let (registry, _) = registry(4);
        let a = registry.resolve(&target("a")).await.unwrap();
        let b = registry.resolve(&target("b")).await.unwrap();
        let _held = a.acquire(WAIT).await.unwrap();
        b.acquire(WAIT).await.unwrap().release().await;

        let stats = registry.aggregate_stats();
        assert_eq!(stats.targets, 2);
        assert_eq!(stats.borrowed, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.capacity, 6);
        assert_eq!(registry.stats(a.identity()).unwrap().borrowed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_counts_borrowers_of_evicted_pools() {
        let (registry, _) = registry(1);
        let first = registry.resolve(&target("first")).await.unwrap();
        let held = first.acquire(WAIT).await.unwrap();
        registry.resolve(&target("second")).await.unwrap();
        assert!(registry.get(first.identity()).is_none());
        drop(first);

        let outstanding = registry.shutdown(Duration::from_millis(200)).await;
        assert_eq!(outstanding, 1);

        held.release().await;
        assert_eq!(registry.total_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_pool_stays_open_after_concurrent_shutdown() {
        let (registry, _) = registry(64);
        let registry = Arc::new(registry);

        let resolvers: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.resolve(&target(&format!("db{i}"))).await })
            })
            .collect();
        let outstanding = registry.shutdown(Duration::from_millis(200)).await;
        assert_eq!(outstanding, 0);

        for resolver in resolvers {
            match resolver.await.unwrap() {
                Ok(pool) => assert_eq!(pool.lifecycle(), crate::pool::Lifecycle::ShuttingDown),
                Err(err) => assert_eq!(err, PoolError::ShuttingDown),
            }
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_outstanding_borrowers() {
        let (registry, _) = registry(4);
        let pool = registry.resolve(&target("db1")).await.unwrap();
        let held = pool.acquire(WAIT).await.unwrap();

        let outstanding = registry.shutdown(Duration::from_millis(200)).await;
        assert_eq!(outstanding, 1);
        assert!(registry.is_empty());
        assert_eq!(
            registry.resolve(&target("db1")).await.unwrap_err(),
            PoolError::ShuttingDown
        );

        held.release().await;
        assert_eq!(registry.total_connections(), 0);
    }
}
