//! # quiver-pool
//!
//! A bounded, semaphore-guarded pool of managed connections: expensive,
//! reusable resources checked out by callers and recycled on return. The
//! pool enforces a hard cap on outstanding connections through a fair
//! permit gate, reuses warm connections LIFO, evicts idle ones FIFO,
//! periodically validates liveness, and keeps a configurable floor of
//! pre-warmed connections.
//!
//! Resource I/O is delegated to a [`ManagedConnectionFactory`]; the pool
//! itself only orchestrates permits, inventory, and lifecycle.
//!
//! ```rust,ignore
//! use quiver_pool::{Pool, PoolConfig};
//!
//! let pool = Pool::new(factory, subject, request_info, PoolConfig::default())?;
//!
//! let conn = pool.acquire().await?;
//! // use *conn.connection().unwrap() ...
//! // returned to the pool when the guard drops
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod guard;
pub mod handle;
mod maintenance;
pub mod pool;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use factory::{ManagedConnectionFactory, PoolObserver};
pub use guard::PoolGuard;
pub use handle::{ConnectionHandle, ConnectionState};
pub use pool::{Pool, PoolStats};
