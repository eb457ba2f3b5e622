//! Connection factory seam.
//!
//! The pool never talks to a database itself. The embedding connector
//! supplies a [`ConnectionFactory`] that opens, checks and closes its own
//! driver connections; the pool only tracks ownership and timestamps.

use std::future::Future;
use std::pin::Pin;

use tidepool_core::TargetConfig;

/// Boxed future alias used by the factory trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Factory for creating new connections, injected by the connector.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The opaque driver connection handed to borrowers.
    type Connection: Send + 'static;

    /// Establish a new connection to the given target.
    ///
    /// Failures are reported to the borrower as
    /// [`PoolError::Connection`](crate::PoolError::Connection) and are
    /// not retried by the pool.
    fn connect<'a>(
        &'a self,
        target: &'a TargetConfig,
    ) -> BoxFuture<'a, Result<Self::Connection, String>>;

    /// Liveness check. Returns `true` if the connection can be reused.
    fn is_healthy<'a>(&'a self, _conn: &'a mut Self::Connection) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    /// Close the underlying transport.
    fn close(&self, conn: Self::Connection) -> BoxFuture<'_, ()> {
        Box::pin(async move { drop(conn) })
    }
}
