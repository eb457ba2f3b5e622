//! Borrowed connection handle.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tidepool_core::TargetIdentity;
use tokio::time::Instant;

use crate::factory::ConnectionFactory;
use crate::pool::TargetPool;

/// A driver connection plus the metadata the pool tracks for it.
pub(crate) struct Tracked<C> {
    pub(crate) id: u64,
    pub(crate) conn: C,
    pub(crate) created_at: Instant,
    /// When the connection last entered the idle set.
    pub(crate) idle_since: Instant,
}

impl<C> Tracked<C> {
    pub(crate) fn new(id: u64, conn: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            idle_since: now,
        }
    }
}

/// A connection checked out of a [`TargetPool`].
///
/// Dereferences to the driver connection. Exactly one borrower holds it at
/// a time; it goes back to the pool through [`release`](Self::release) or,
/// if the borrower forgets, when it is dropped. A connection marked broken
/// (or dropped during a panic) is closed instead of being pooled again.
pub struct PooledConnection<F: ConnectionFactory> {
    inner: Option<Tracked<F::Connection>>,
    pool: Arc<TargetPool<F>>,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(tracked: Tracked<F::Connection>, pool: Arc<TargetPool<F>>) -> Self {
        Self {
            inner: Some(tracked),
            pool,
            broken: false,
        }
    }

    /// Pool-assigned connection id, unique for the life of the process.
    pub fn id(&self) -> u64 {
        self.tracked().id
    }

    /// When the physical connection was opened.
    pub fn created_at(&self) -> Instant {
        self.tracked().created_at
    }

    /// Identity of the target this connection belongs to.
    pub fn identity(&self) -> &TargetIdentity {
        self.pool.identity()
    }

    /// Flag the connection as unusable so that release discards it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Ask the factory whether the connection is still alive.
    pub async fn check_health(&mut self) -> bool {
        let pool = Arc::clone(&self.pool);
        match self.inner.as_mut() {
            Some(tracked) => pool.factory().is_healthy(&mut tracked.conn).await,
            None => false,
        }
    }

    /// Return the connection to its pool, closing it if it is broken or the
    /// pool no longer accepts returns.
    pub async fn release(mut self) {
        if let Some(tracked) = self.inner.take() {
            let pool = Arc::clone(&self.pool);
            if let Some(doomed) = pool.check_in(tracked, self.broken) {
                pool.close(doomed).await;
            }
        }
    }

    /// Take the connection out without checking it back in. The pool
    /// still counts it as borrowed until the caller settles that.
    pub(crate) fn detach(mut self) -> Tracked<F::Connection> {
        match self.inner.take() {
            Some(tracked) => tracked,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn tracked(&self) -> &Tracked<F::Connection> {
        match &self.inner {
            Some(tracked) => tracked,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.tracked().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            Some(tracked) => &mut tracked.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(tracked) = self.inner.take() {
            let broken = self.broken || std::thread::panicking();
            if let Some(doomed) = self.pool.check_in(tracked, broken) {
                self.pool.close_detached(doomed);
            }
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.inner.as_ref().map(|t| t.id))
            .field("target", self.pool.identity())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
