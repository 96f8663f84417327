//! Background duties: idle eviction, liveness validation, and filling.
//!
//! The sweeps themselves are pool methods so they can be driven directly
//! (and tested deterministically); registration spawns one ticking task
//! per duty, holding only a `Weak` reference so an abandoned pool winds
//! down on its own.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::factory::ManagedConnectionFactory;
use crate::handle::{ConnectionHandle, ConnectionState};
use crate::pool::{Pool, PoolInner, PoolState};

/// Cancellation tokens for the spawned maintenance tasks.
#[derive(Default)]
pub(crate) struct MaintenanceTasks {
    idle_reaper: Option<CancellationToken>,
    validator: Option<CancellationToken>,
}

impl MaintenanceTasks {
    fn cancel_all(&mut self) {
        if let Some(token) = self.idle_reaper.take() {
            token.cancel();
        }
        if let Some(token) = self.validator.take() {
            token.cancel();
        }
    }
}

impl<F: ManagedConnectionFactory> Pool<F> {
    /// Spawn the idle reaper and the background validator, replacing any
    /// previous registration.
    pub(crate) fn start_maintenance(&self) {
        let inner = self.inner();
        let mut tasks = inner.tasks.lock();
        tasks.cancel_all();

        if !inner.config.idle_timeout.is_zero() {
            let token = CancellationToken::new();
            let period = (inner.config.idle_timeout / 2).max(Duration::from_millis(1));
            tokio::spawn(idle_reaper_loop(self.downgrade(), period, token.clone()));
            tasks.idle_reaper = Some(token);
        }

        if !inner.config.background_validation_interval.is_zero() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                interval_ms = inner.config.background_validation_interval.as_millis() as u64,
                "registering for background validation"
            );
            let token = CancellationToken::new();
            let period = inner.config.background_validation_interval;
            tokio::spawn(validator_loop(self.downgrade(), period, token.clone()));
            tasks.validator = Some(token);
        }
    }

    pub(crate) fn stop_maintenance(&self) {
        self.inner().tasks.lock().cancel_all();
    }

    /// Evict idle connections older than `idle_timeout`, oldest first.
    ///
    /// The inventory is chronologically ordered, so the sweep inspects the
    /// head and stops at the first connection that is still fresh. With
    /// `strict_min`, eviction stops once the inventory is down to
    /// `min_size`.
    pub async fn remove_idle_connections(&self) {
        let inner = self.inner();
        if inner.config.idle_timeout.is_zero() {
            return;
        }
        let Some(cutoff) = Instant::now().checked_sub(inner.config.idle_timeout) else {
            return;
        };

        let mut destroy_list = Vec::new();
        loop {
            let cl = {
                let mut state = inner.state.lock();
                let evict = match state.inventory.front() {
                    Some(head) => head.is_timed_out(cutoff) && should_remove(&state, &inner.config),
                    None => false,
                };
                if evict {
                    state.inventory.pop_front()
                } else {
                    None
                }
            };
            let Some(cl) = cl else { break };
            destroy_list.push(cl);
        }

        if destroy_list.is_empty() {
            return;
        }

        for cl in &destroy_list {
            #[cfg(feature = "tracing")]
            tracing::trace!(id = cl.id(), "destroying timed out connection");
            self.do_destroy(cl).await;
        }

        if !inner.shutdown.load(Ordering::SeqCst) && inner.config.min_size > 0 {
            self.spawn_fill();
        }

        let observer = inner.observer.lock().clone();
        if let Some(observer) = observer {
            observer.pool_emptied();
        }
    }

    /// Validate idle connections whose last validation is older than the
    /// configured interval.
    ///
    /// Holds one permit for the duration so validation at peak capacity
    /// serializes against checkout instead of starving callers.
    pub async fn validate_connections(&self) {
        let inner = self.inner();
        let interval = inner.config.background_validation_interval;
        if interval.is_zero() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("attempting to validate idle connections");

        let permit = match tokio::time::timeout(
            inner.config.blocking_timeout,
            inner.permits.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // No permit within the timeout: try again at the next tick.
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!("no permit available for background validation");
                return;
            }
        };

        let mut any_destroyed = false;
        loop {
            let cl = {
                let mut state = inner.state.lock();
                take_stale(&mut state, interval)
            };
            let Some(cl) = cl else { break };

            if inner.factory.supports_validation() {
                let invalid = match self.probe_validity(&cl).await {
                    Ok(valid) => !valid,
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(id = cl.id(), error = %_e, "error validating connection");
                        false
                    }
                };
                if invalid && cl.state() != ConnectionState::Destroy {
                    self.do_destroy(&cl).await;
                    any_destroyed = true;
                    continue;
                }
            } else if !inner.validation_warned.swap(true, Ordering::SeqCst) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "background validation was specified with a non-validating connection factory"
                );
            }

            // Still healthy (or unvalidatable): restamp and return to the
            // tail so the scan terminates.
            let mut state = inner.state.lock();
            cl.touch_validated(Instant::now());
            state.inventory.push_back(cl);
        }

        drop(permit);

        if any_destroyed && !inner.shutdown.load(Ordering::SeqCst) && inner.config.min_size > 0 {
            self.spawn_fill();
        }
    }

    async fn probe_validity(&self, cl: &std::sync::Arc<ConnectionHandle<F::Connection>>) -> crate::error::Result<bool> {
        let Some(conn) = cl.take_connection() else {
            return Ok(false);
        };
        let res = self.inner().factory.is_valid(&conn).await;
        cl.restore_connection(conn);
        res
    }

    /// Manufacture connections until the pool holds `min_size`, counting
    /// both idle and checked-out connections.
    ///
    /// Each iteration takes (and afterwards releases) one permit, so the
    /// filler cannot push the pool past `max_size` and backs off while all
    /// permits are checked out. Sizes are re-read every iteration; a
    /// momentary under-count is corrected by the next pass.
    pub async fn fill_to_min(&self) {
        let inner = self.inner();
        loop {
            let permit = match tokio::time::timeout(
                inner.config.blocking_timeout,
                inner.permits.acquire(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                _ => return,
            };

            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let deficit = {
                let state = inner.state.lock();
                inner
                    .config
                    .min_size
                    .saturating_sub(state.inventory.len() + state.checked_out.len())
            };
            if deficit == 0 {
                return;
            }

            match self
                .manufacture(&inner.default_subject, &inner.default_request)
                .await
            {
                Ok(cl) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(id = cl.id(), "filling pool");
                    inner.state.lock().inventory.push_back(cl);
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "unable to fill pool");
                    return;
                }
            }

            drop(permit);
        }
    }

    /// Run `fill_to_min` on a worker task. At most one fill task runs per
    /// pool; a request that finds one already running is dropped (the next
    /// maintenance pass re-triggers if a deficit remains).
    pub(crate) fn spawn_fill(&self) {
        let inner = self.inner();
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if inner.filling.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        drop(tokio::spawn(async move {
            pool.fill_to_min().await;
            pool.inner().filling.store(false, Ordering::SeqCst);
        }));
    }
}

fn should_remove<C>(state: &PoolState<C>, config: &PoolConfig) -> bool {
    if config.strict_min {
        state.inventory.len() > config.min_size
    } else {
        true
    }
}

/// Take the first idle connection whose last validation is older than
/// `interval`. Index scan plus `remove(idx)`, so the inventory is never
/// mutated mid-iteration.
fn take_stale<C>(
    state: &mut PoolState<C>,
    interval: Duration,
) -> Option<std::sync::Arc<ConnectionHandle<C>>> {
    let now = Instant::now();
    let idx = state
        .inventory
        .iter()
        .position(|cl| now.duration_since(cl.last_validated()) >= interval)?;
    state.inventory.remove(idx)
}

async fn idle_reaper_loop<F: ManagedConnectionFactory>(
    pool: Weak<PoolInner<F>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else { return };
        Pool::from_inner(inner).remove_idle_connections().await;
    }
}

async fn validator_loop<F: ManagedConnectionFactory>(
    pool: Weak<PoolInner<F>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else { return };
        Pool::from_inner(inner).validate_connections().await;
    }
}
