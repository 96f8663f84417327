//! The pool's wrapper around a managed connection.
//!
//! A [`ConnectionHandle`] is owned by the pool while idle and shared with
//! the caller while checked out, so every field is interior-mutable. The
//! connection itself lives in a take/restore slot: the pool takes it out,
//! performs factory I/O without any lock held, and puts it back.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// In service: idle in the inventory or checked out.
    Normal = 0,
    /// Marked for destruction; the holder destroys it on return.
    Destroy = 1,
    /// Destroyed. Terminal; the underlying resource is released.
    Destroyed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Destroy,
            _ => Self::Destroyed,
        }
    }
}

struct Timestamps {
    last_used: Instant,
    last_validated: Instant,
}

/// Handle to one managed connection, tagged with state and timestamps.
///
/// Handles are compared and hashed by identity: each one gets a unique id
/// at creation, which also keys the pool's permit ledger.
pub struct ConnectionHandle<C> {
    id: u64,
    state: AtomicU8,
    conn: Mutex<Option<C>>,
    times: Mutex<Timestamps>,
}

impl<C> ConnectionHandle<C> {
    pub(crate) fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ConnectionState::Normal as u8),
            conn: Mutex::new(Some(conn)),
            times: Mutex::new(Timestamps {
                last_used: now,
                last_validated: now,
            }),
        }
    }

    /// Unique identity of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Overwrite the lifecycle state.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Transition to `Destroyed`. Returns `true` if this call performed
    /// the transition, `false` if the handle was already destroyed.
    pub(crate) fn begin_destroy(&self) -> bool {
        let prev = self.state.swap(ConnectionState::Destroyed as u8, Ordering::SeqCst);
        ConnectionState::from_u8(prev) != ConnectionState::Destroyed
    }

    /// Access the managed connection, if it has not been destroyed.
    ///
    /// Returns `None` once the connection has been destroyed, or while the
    /// pool has temporarily taken it out for factory I/O.
    pub fn connection(&self) -> Option<MappedMutexGuard<'_, C>> {
        MutexGuard::try_map(self.conn.lock(), |slot| slot.as_mut()).ok()
    }

    pub(crate) fn take_connection(&self) -> Option<C> {
        self.conn.lock().take()
    }

    pub(crate) fn restore_connection(&self, conn: C) {
        *self.conn.lock() = Some(conn);
    }

    /// Stamp the last-used time.
    pub(crate) fn used(&self) {
        self.times.lock().last_used = Instant::now();
    }

    /// Whether the last use is at or before `cutoff`.
    pub(crate) fn is_timed_out(&self, cutoff: Instant) -> bool {
        self.times.lock().last_used <= cutoff
    }

    pub(crate) fn last_validated(&self) -> Instant {
        self.times.lock().last_validated
    }

    pub(crate) fn touch_validated(&self, at: Instant) {
        self.times.lock().last_validated = at;
    }
}

impl<C> PartialEq for ConnectionHandle<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<C> Eq for ConnectionHandle<C> {}

impl<C> Hash for ConnectionHandle<C> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<C> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
