//! RAII guard for checked-out connections.

use std::sync::Arc;

use crate::factory::ManagedConnectionFactory;
use crate::handle::ConnectionHandle;
use crate::pool::Pool;

/// RAII wrapper around a checked-out connection handle.
///
/// When the guard is dropped, the handle is returned to the pool on a
/// spawned task. Use [`put_back`](Self::put_back) or [`kill`](Self::kill)
/// to return deterministically, or [`detach`](Self::detach) to take over
/// the explicit return protocol.
pub struct PoolGuard<F: ManagedConnectionFactory> {
    pool: Pool<F>,
    handle: Option<Arc<ConnectionHandle<F::Connection>>>,
    kill: bool,
}

impl<F: ManagedConnectionFactory> PoolGuard<F> {
    pub(crate) fn new(pool: Pool<F>, handle: Arc<ConnectionHandle<F::Connection>>) -> Self {
        Self {
            pool,
            handle: Some(handle),
            kill: false,
        }
    }

    /// The wrapped handle.
    pub fn handle(&self) -> &Arc<ConnectionHandle<F::Connection>> {
        self.handle.as_ref().expect("guard used after detach")
    }

    /// Mark the connection so the eventual return destroys it.
    pub fn mark_kill(&mut self) {
        self.kill = true;
    }

    /// Return the connection to the pool now.
    pub async fn put_back(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.return_connection(handle, self.kill).await;
        }
    }

    /// Return the connection to the pool now, destroying it.
    pub async fn kill(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.return_connection(handle, true).await;
        }
    }

    /// Take the handle out, opting out of the automatic return. The caller
    /// is then responsible for
    /// [`Pool::return_connection`](crate::Pool::return_connection).
    #[must_use]
    pub fn detach(mut self) -> Arc<ConnectionHandle<F::Connection>> {
        self.handle.take().expect("guard used after detach")
    }
}

impl<F: ManagedConnectionFactory> std::ops::Deref for PoolGuard<F> {
    type Target = ConnectionHandle<F::Connection>;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref().expect("guard used after detach")
    }
}

impl<F: ManagedConnectionFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let pool = self.pool.clone();
            let kill = self.kill;
            drop(tokio::spawn(async move {
                pool.return_connection(handle, kill).await;
            }));
        }
    }
}

impl<F: ManagedConnectionFactory> std::fmt::Debug for PoolGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("handle", &self.handle)
            .field("kill", &self.kill)
            .finish()
    }
}
