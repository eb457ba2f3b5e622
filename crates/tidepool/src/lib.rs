//! tidepool: target-keyed, capacity-bounded async connection pooling.
//!
//! A connector that talks to many databases on behalf of many callers keeps
//! one pool per [`TargetIdentity`](tidepool_core::TargetIdentity), caps the
//! connections each target and the whole process may hold, and evicts the
//! least recently used target when too many are tracked.
//!
//! # Architecture
//!
//! ```text
//! handler → ConnectionBroker::acquire(target, timeout)
//!   → PoolRegistry::resolve(target)
//!     → existing pool → touch
//!     → new pool → [evict LRU pool if at global_max_targets]
//!   → TargetPool::acquire(timeout)
//!     → idle connection (health-checked) → lend
//!     → room under pool_size + max_overflow and global budget → factory.connect()
//!     → otherwise → FIFO queue until release, permit or timeout
//! handler → PooledConnection::release() → oldest waiter, idle set, or close
//! Reaper (every reaper_interval) → close idle > idle_timeout → drop empty pools
//! ```
//!
//! - **broker**: public entry point, owns the reaper
//! - **registry**: identity → pool map with LRU eviction
//! - **pool**: per-target idle set, counts and wait queue
//! - **reaper**: background idle trimming
//! - **factory**: the seam connectors implement to open and close connections
//! - **tcp**: ready-made TCP/TLS factory

mod budget;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod pool;
pub mod reaper;
pub mod registry;
pub mod stats;
pub mod tcp;

#[cfg(test)]
mod testing;

pub use broker::ConnectionBroker;
pub use config::PoolConfig;
pub use connection::PooledConnection;
pub use error::{PoolError, PoolResult};
pub use factory::{BoxFuture, ConnectionFactory};
pub use pool::{Lifecycle, TargetPool};
pub use reaper::Reaper;
pub use registry::{PoolRegistry, ReapReport};
pub use stats::PoolStats;
pub use tcp::{TcpConnection, TcpConnectionFactory, TlsConfig};
pub use tidepool_core::{Encryption, TargetConfig, TargetIdentity};
