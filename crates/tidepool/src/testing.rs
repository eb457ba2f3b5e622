//! Mock connection factory shared by the unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::TargetConfig;

use crate::config::PoolConfig;
use crate::factory::{BoxFuture, ConnectionFactory};

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MockConn {
    pub serial: u64,
    pub host: String,
}

pub(crate) struct MockFactory {
    connects: AtomicU64,
    pub should_fail: AtomicBool,
    pub healthy: AtomicBool,
    unhealthy: Mutex<HashSet<u64>>,
    closed: Mutex<Vec<u64>>,
    delay: Duration,
    health_delay: Duration,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            connects: AtomicU64::new(0),
            should_fail: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            unhealthy: Mutex::new(HashSet::new()),
            closed: Mutex::new(Vec::new()),
            delay,
            health_delay: Duration::ZERO,
        }
    }

    /// Make every health check take `delay`.
    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<u64> {
        self.closed.lock().clone()
    }

    pub fn poison(&self, serial: u64) {
        self.unhealthy.lock().insert(serial);
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConn;

    fn connect<'a>(&'a self, target: &'a TargetConfig) -> BoxFuture<'a, Result<MockConn, String>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.should_fail.load(Ordering::SeqCst) {
                return Err("connection refused".to_string());
            }
            let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockConn {
                serial,
                host: target.host.clone(),
            })
        })
    }

    fn is_healthy<'a>(&'a self, conn: &'a mut MockConn) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if !self.health_delay.is_zero() {
                tokio::time::sleep(self.health_delay).await;
            }
            self.healthy.load(Ordering::SeqCst) && !self.unhealthy.lock().contains(&conn.serial)
        })
    }

    fn close(&self, conn: MockConn) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.lock().push(conn.serial);
        })
    }
}

pub(crate) fn target(host: &str) -> TargetConfig {
    TargetConfig::new(host, 1433, "sales", "svc_reader")
}

pub(crate) fn config(pool_size: usize, max_overflow: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        max_overflow,
        global_max_connections: 100,
        global_max_targets: 10,
        idle_timeout: Duration::from_secs(60),
        reaper_interval: Duration::from_secs(10),
        acquire_timeout_default: Duration::from_millis(200),
        health_check_on_acquire: true,
        drain_timeout: Duration::from_millis(200),
    }
}

pub(crate) fn factory() -> Arc<MockFactory> {
    Arc::new(MockFactory::new())
}
