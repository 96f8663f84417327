//! Collaborator traits: the connection factory and the outer-pool observer.
//!
//! The pool itself never opens or closes anything; a
//! [`ManagedConnectionFactory`] does all resource I/O. The pool guarantees
//! it never issues two concurrent factory calls against the same
//! connection.

use async_trait::async_trait;

use crate::error::Result;

/// Factory for the expensive, reusable resources the pool manages.
///
/// `Subject` and `RequestInfo` carry the caller's credentials and
/// per-request parameters; defaults for both are supplied when the pool is
/// constructed, so checkout callers may pass `None`.
#[async_trait]
pub trait ManagedConnectionFactory: Send + Sync + 'static {
    /// The managed-connection type produced by this factory.
    type Connection: Send + 'static;
    /// Caller credentials (e.g. an authenticated principal).
    type Subject: Send + Sync + 'static;
    /// Per-request connection parameters.
    type RequestInfo: Send + Sync + 'static;

    /// Create a new managed connection for the given credentials.
    async fn create(
        &self,
        subject: &Self::Subject,
        request: &Self::RequestInfo,
    ) -> Result<Self::Connection>;

    /// Decide whether an idle connection can serve the given credentials.
    ///
    /// `Ok(false)` means no candidate matches; an `Err` is treated the same
    /// way. In both cases the pool destroys the candidate and either scans
    /// on or fast-fails to manufacture, per configuration.
    async fn matches(
        &self,
        conn: &Self::Connection,
        subject: &Self::Subject,
        request: &Self::RequestInfo,
    ) -> Result<bool>;

    /// Reset a connection's client-visible state before it re-enters the
    /// idle inventory. A failure here forces the connection's destruction.
    async fn cleanup(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Release a connection's underlying resource. Failures are logged by
    /// the pool and otherwise ignored; the connection is gone either way.
    async fn destroy(&self, conn: Self::Connection) -> Result<()>;

    /// Whether this factory can judge connection liveness.
    ///
    /// Background validation consults this once; factories that return
    /// `false` get a one-shot warning and their connections are left
    /// untouched.
    fn supports_validation(&self) -> bool {
        false
    }

    /// Judge whether an idle connection is still alive.
    ///
    /// Only consulted when [`supports_validation`](Self::supports_validation)
    /// returns `true`. An `Err` leaves the connection in the pool with a
    /// refreshed validation stamp.
    async fn is_valid(&self, _conn: &Self::Connection) -> Result<bool> {
        Ok(true)
    }
}

/// Hook for the outer pool that groups sub-pools.
///
/// Invoked after an idle sweep destroyed connections; the observer may
/// consult [`Pool::is_empty`](crate::Pool::is_empty) and decide to discard
/// the sub-pool.
pub trait PoolObserver: Send + Sync {
    /// The sub-pool's idle sweep destroyed connections and the sub-pool
    /// may now be empty.
    fn pool_emptied(&self);
}
