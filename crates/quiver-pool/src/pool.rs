//! The pool core: permit gate, inventory, and the checkout/return protocol.
//!
//! One `parking_lot::Mutex` protects the inventory and the checked-out set
//! together; it is held only for O(1) list/set work and never across an
//! `.await`. The fair `tokio::sync::Semaphore` caps outstanding
//! connections, and a `DashMap` ledger records which handle holds a permit
//! so that every success and failure path releases exactly once.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::factory::{ManagedConnectionFactory, PoolObserver};
use crate::guard::PoolGuard;
use crate::handle::{ConnectionHandle, ConnectionState};
use crate::maintenance::MaintenanceTasks;

/// Snapshot of pool state and lifetime counters.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections idle in the inventory.
    pub idle: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// High-water mark of concurrently outstanding connections.
    pub max_used: usize,
    /// Permits currently available on the gate.
    pub available_permits: usize,
    /// Permits currently held on behalf of checked-out connections.
    pub held_permits: usize,
    /// Connections manufactured over the pool's lifetime.
    pub created: u64,
    /// Connections destroyed over the pool's lifetime.
    pub destroyed: u64,
}

/// Inventory plus checked-out set, guarded by one mutex.
pub(crate) struct PoolState<C> {
    /// Idle connections in chronological insertion order: head = oldest
    /// (FIFO idle sweep), tail = most recently returned (LIFO reuse).
    pub(crate) inventory: VecDeque<Arc<ConnectionHandle<C>>>,
    /// Connections currently held by callers.
    pub(crate) checked_out: HashSet<Arc<ConnectionHandle<C>>>,
    /// Monotonic high-water mark of `max_size - available_permits`.
    pub(crate) max_used: usize,
}

pub(crate) struct PoolInner<F: ManagedConnectionFactory> {
    pub(crate) factory: Arc<F>,
    pub(crate) default_subject: F::Subject,
    pub(crate) default_request: F::RequestInfo,
    pub(crate) config: PoolConfig,
    pub(crate) state: Mutex<PoolState<F::Connection>>,
    /// Fair gate: one permit per outstanding (or in-manufacture) connection.
    pub(crate) permits: Semaphore,
    /// Which handles hold a permit, keyed by handle id. The single source
    /// of truth consulted before any release.
    pub(crate) permit_holders: DashMap<u64, ()>,
    pub(crate) started: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    /// One fill task at a time.
    pub(crate) filling: AtomicBool,
    /// One-shot warning for validation against a non-validating factory.
    pub(crate) validation_warned: AtomicBool,
    pub(crate) observer: Mutex<Option<Arc<dyn PoolObserver>>>,
    pub(crate) tasks: Mutex<MaintenanceTasks>,
    pub(crate) created: AtomicU64,
    pub(crate) destroyed: AtomicU64,
}

/// A bounded, semaphore-guarded pool of managed connections.
///
/// Cloning is cheap and shares the same pool. Constructing a pool with
/// `prefill`, a nonzero `idle_timeout`, or a nonzero
/// `background_validation_interval` spawns background tasks and therefore
/// requires a Tokio runtime context.
pub struct Pool<F: ManagedConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ManagedConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ManagedConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("stats", &self.stats()).finish()
    }
}

impl<F: ManagedConnectionFactory> Pool<F> {
    /// Create a new pool around `factory`.
    ///
    /// `default_subject` and `default_request` serve checkouts that pass
    /// `None`, and all connections manufactured by the filler.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid (e.g. `max_size == 0`).
    pub fn new(
        factory: F,
        default_subject: F::Subject,
        default_request: F::RequestInfo,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let max = config.max_size;
        let prefill = config.prefill;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            max_size = config.max_size,
            min_size = config.min_size,
            "created managed-connection pool"
        );

        let pool = Self {
            inner: Arc::new(PoolInner {
                factory: Arc::new(factory),
                default_subject,
                default_request,
                state: Mutex::new(PoolState {
                    inventory: VecDeque::with_capacity(max),
                    checked_out: HashSet::new(),
                    max_used: 0,
                }),
                permits: Semaphore::new(max),
                permit_holders: DashMap::new(),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                filling: AtomicBool::new(false),
                validation_warned: AtomicBool::new(false),
                observer: Mutex::new(None),
                tasks: Mutex::new(MaintenanceTasks::default()),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                config,
            }),
        };

        if prefill {
            pool.spawn_fill();
        }
        pool.reenable();

        Ok(pool)
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner<F>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &PoolInner<F> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<PoolInner<F>> {
        Arc::downgrade(&self.inner)
    }

    /// Register the observer notified after idle sweeps.
    pub fn set_observer(&self, observer: Arc<dyn PoolObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    // -----------------------------------------------------------------
    // Checkout
    // -----------------------------------------------------------------

    /// Check out a connection matched to the given credentials.
    ///
    /// Blocks up to `blocking_timeout` for a permit, then reuses the most
    /// recently returned idle connection that the factory matches, or
    /// manufactures a new one. `None` falls back to the defaults supplied
    /// at construction.
    ///
    /// The returned handle must eventually be given back through
    /// [`return_connection`](Self::return_connection) (or use
    /// [`acquire`](Self::acquire) for an RAII guard). Dropping the future
    /// after the permit phase has completed can leak a permit; prefer
    /// [`checkout_cancellable`](Self::checkout_cancellable) when the call
    /// must be interruptible.
    pub async fn checkout(
        &self,
        subject: Option<&F::Subject>,
        request: Option<&F::RequestInfo>,
    ) -> Result<Arc<ConnectionHandle<F::Connection>>> {
        self.acquire_permit().await?;
        self.checkout_holding_permit(subject, request).await
    }

    /// Check out a connection, giving up with [`Error::Interrupted`] if
    /// `cancel` fires while waiting for a permit.
    pub async fn checkout_cancellable(
        &self,
        subject: Option<&F::Subject>,
        request: Option<&F::RequestInfo>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionHandle<F::Connection>>> {
        let start = Instant::now();
        tokio::select! {
            res = self.acquire_permit() => res?,
            () = cancel.cancelled() => {
                return Err(Error::Interrupted {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
        self.checkout_holding_permit(subject, request).await
    }

    /// Check out with the defaults and wrap the handle in an RAII guard
    /// that returns it when dropped.
    pub async fn acquire(&self) -> Result<PoolGuard<F>> {
        let handle = self.checkout(None, None).await?;
        Ok(PoolGuard::new(self.clone(), handle))
    }

    /// Acquire one permit within the blocking timeout, detaching it from
    /// the semaphore on success. Every path after this owes exactly one
    /// `add_permits(1)`, paid either at return time via the ledger or
    /// directly on a failed checkout.
    async fn acquire_permit(&self) -> Result<()> {
        let timeout = self.inner.config.blocking_timeout;
        match tokio::time::timeout(timeout, self.inner.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            // The semaphore is never closed by this pool.
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => Err(Error::NoCapacity {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn checkout_holding_permit(
        &self,
        subject: Option<&F::Subject>,
        request: Option<&F::RequestInfo>,
    ) -> Result<Arc<ConnectionHandle<F::Connection>>> {
        let inner = &self.inner;
        let subject = subject.unwrap_or(&inner.default_subject);
        let request = request.unwrap_or(&inner.default_request);

        // Scan the inventory, most recently returned first.
        loop {
            let candidate = {
                let mut state = inner.state.lock();
                if inner.shutdown.load(Ordering::SeqCst) {
                    inner.permits.add_permits(1);
                    return Err(Error::ShuttingDown);
                }
                match state.inventory.pop_back() {
                    Some(cl) => {
                        state.checked_out.insert(Arc::clone(&cl));
                        Self::note_usage(&mut state, inner);
                        Some(cl)
                    }
                    None => None,
                }
            };
            let Some(cl) = candidate else { break };

            match self.match_candidate(&cl, subject, request).await {
                Ok(true) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(id = cl.id(), "supplying connection from pool");
                    inner.permit_holders.insert(cl.id(), ());
                    return Ok(cl);
                }
                Ok(false) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        id = cl.id(),
                        "destroying connection that could not be successfully matched"
                    );
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        id = cl.id(),
                        error = %_e,
                        "error while trying to match connection, destroying it"
                    );
                }
            }

            // Match miss or failure: the candidate is gone either way.
            inner.state.lock().checked_out.remove(&cl);
            self.do_destroy(&cl).await;

            if inner.config.use_fast_fail {
                #[cfg(feature = "tracing")]
                tracing::trace!(
                    "fast failing connection attempt, manufacturing a new connection immediately"
                );
                break;
            }
        }

        // Nothing usable in the inventory: manufacture a new connection.
        match self.manufacture(subject, request).await {
            Ok(cl) => {
                {
                    let mut state = inner.state.lock();
                    state.checked_out.insert(Arc::clone(&cl));
                    Self::note_usage(&mut state, inner);
                }

                if !inner.started.swap(true, Ordering::SeqCst) && inner.config.min_size > 0 {
                    self.spawn_fill();
                }

                #[cfg(feature = "tracing")]
                tracing::trace!(id = cl.id(), "supplying new connection");
                inner.permit_holders.insert(cl.id(), ());
                Ok(cl)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "error while attempting to get a new connection");
                inner.permits.add_permits(1);
                Err(e)
            }
        }
    }

    fn note_usage(state: &mut PoolState<F::Connection>, inner: &PoolInner<F>) {
        let in_use = inner
            .config
            .max_size
            .saturating_sub(inner.permits.available_permits());
        state.max_used = state.max_used.max(in_use);
    }

    /// Ask the factory whether `cl` can serve the given credentials,
    /// without holding any lock across the call.
    async fn match_candidate(
        &self,
        cl: &Arc<ConnectionHandle<F::Connection>>,
        subject: &F::Subject,
        request: &F::RequestInfo,
    ) -> Result<bool> {
        let Some(conn) = cl.take_connection() else {
            return Ok(false);
        };
        let res = self.inner.factory.matches(&conn, subject, request).await;
        cl.restore_connection(conn);
        res
    }

    pub(crate) async fn manufacture(
        &self,
        subject: &F::Subject,
        request: &F::RequestInfo,
    ) -> Result<Arc<ConnectionHandle<F::Connection>>> {
        let conn = self
            .inner
            .factory
            .create(subject, request)
            .await
            .map_err(Error::create_failed)?;
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ConnectionHandle::new(conn)))
    }

    // -----------------------------------------------------------------
    // Return
    // -----------------------------------------------------------------

    /// Give a connection back to the pool.
    ///
    /// With `kill == false` the connection is cleaned up and re-enters the
    /// inventory; with `kill == true` (or when cleanup fails, or when the
    /// handle is marked for destruction) it is destroyed. Asynchronous
    /// error notifications should route through here with `kill == true`.
    ///
    /// Returning the same handle twice is logged and ignored; at most one
    /// permit is released per checkout.
    pub async fn return_connection(&self, cl: Arc<ConnectionHandle<F::Connection>>, kill: bool) {
        let inner = &self.inner;
        let mut kill = kill;

        // A background duty may have destroyed the connection while it was
        // checked out; all that is left to do is settle the permit.
        {
            let _state = inner.state.lock();
            if cl.state() == ConnectionState::Destroyed {
                #[cfg(feature = "tracing")]
                tracing::trace!(id = cl.id(), "connection returned after it was destroyed");
                if inner.permit_holders.remove(&cl.id()).is_some() {
                    inner.permits.add_permits(1);
                }
                return;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(id = cl.id(), kill, "returning connection to pool");

        // Reset client-visible state outside the lock.
        if let Some(mut conn) = cl.take_connection() {
            if let Err(_e) = inner.factory.cleanup(&mut conn).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = cl.id(), error = %_e, "error cleaning up connection");
                kill = true;
            }
            cl.restore_connection(conn);
        }

        {
            let mut state = inner.state.lock();

            if matches!(
                cl.state(),
                ConnectionState::Destroy | ConnectionState::Destroyed
            ) {
                kill = true;
            }

            state.checked_out.remove(&cl);

            // This is really an error: it can only fire once the capacity
            // invariant has already been broken elsewhere.
            if !kill && state.inventory.len() >= inner.config.max_size {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    id = cl.id(),
                    "destroying returned connection, maximum pool size exceeded"
                );
                kill = true;
            }

            if kill {
                // An asynchronous error notification can return a
                // connection that is still sitting in the inventory.
                if let Some(idx) = state.inventory.iter().position(|h| h.id() == cl.id()) {
                    state.inventory.remove(idx);
                }
            } else {
                cl.used();
                let already_pooled = state.inventory.iter().any(|h| h.id() == cl.id());
                if already_pooled {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(id = cl.id(), "attempt to return connection twice (ignored)");
                } else {
                    state.inventory.push_back(Arc::clone(&cl));
                }
            }

            if inner.permit_holders.remove(&cl.id()).is_some() {
                inner.permits.add_permits(1);
            }
        }

        if kill {
            #[cfg(feature = "tracing")]
            tracing::trace!(id = cl.id(), "destroying returned connection");
            self.do_destroy(&cl).await;
        }
    }

    /// Destroy a connection: mark the handle `Destroyed` and release the
    /// underlying resource. Idempotent; a destroy failure is logged and
    /// the handle stays destroyed.
    pub(crate) async fn do_destroy(&self, cl: &Arc<ConnectionHandle<F::Connection>>) {
        if !cl.begin_destroy() {
            #[cfg(feature = "tracing")]
            tracing::trace!(id = cl.id(), "connection is already destroyed");
            return;
        }

        self.inner.destroyed.fetch_add(1, Ordering::Relaxed);

        if let Some(conn) = cl.take_connection() {
            if let Err(_e) = self.inner.factory.destroy(conn).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(id = cl.id(), error = %_e, "error destroying connection");
            }
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Register with the background schedulers and clear the shutdown
    /// flag. Called at construction; afterwards only the outer pool should
    /// call this, to revive a shut-down sub-pool.
    pub fn reenable(&self) {
        self.start_maintenance();
        self.inner.shutdown.store(false, Ordering::SeqCst);
    }

    /// Shut the pool down: no new checkouts succeed, background duties
    /// stop, and every connection is destroyed (checked-out ones on
    /// return). Terminal unless the outer pool calls
    /// [`reenable`](Self::reenable).
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.stop_maintenance();
        self.flush().await;
    }

    /// Discard every pooled connection. Checked-out connections are marked
    /// for destruction and die on return; idle connections are destroyed
    /// immediately.
    pub async fn flush(&self) {
        let inner = &self.inner;

        let destroy_list: Vec<_> = {
            let mut state = inner.state.lock();

            #[cfg(feature = "tracing")]
            tracing::trace!(
                checked_out = state.checked_out.len(),
                idle = state.inventory.len(),
                "flushing pool"
            );

            for cl in &state.checked_out {
                cl.set_state(ConnectionState::Destroy);
            }
            state.inventory.drain(..).collect()
        };

        let destroyed_any = !destroy_list.is_empty();
        for cl in &destroy_list {
            self.do_destroy(cl).await;
        }

        if destroyed_any && !inner.shutdown.load(Ordering::SeqCst) && inner.config.min_size > 0 {
            self.spawn_fill();
        }
    }

    // -----------------------------------------------------------------
    // Accounting
    // -----------------------------------------------------------------

    /// Whether the pool holds no connections, idle or checked out.
    pub fn is_empty(&self) -> bool {
        let state = self.inner.state.lock();
        state.inventory.is_empty() && state.checked_out.is_empty()
    }

    /// Whether the pool has not been shut down.
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently outstanding connections.
    pub fn max_used_connections(&self) -> usize {
        self.inner.state.lock().max_used
    }

    /// Snapshot current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (idle, active, max_used) = {
            let state = self.inner.state.lock();
            (
                state.inventory.len(),
                state.checked_out.len(),
                state.max_used,
            )
        };
        PoolStats {
            idle,
            active,
            max_used,
            available_permits: self.inner.permits.available_permits(),
            held_permits: self.inner.permit_holders.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
        }
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The factory collaborator this pool manufactures through.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}
