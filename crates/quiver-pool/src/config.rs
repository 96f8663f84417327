//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a managed-connection pool.
///
/// All values are frozen when the pool is constructed; in particular
/// `max_size` sizes the permit semaphore, which cannot be resized
/// dynamically.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfig {
    /// Hard cap on concurrently outstanding connections
    pub max_size: usize,
    /// Floor of pre-warmed connections maintained by the filler
    pub min_size: usize,
    /// Maximum time a checkout waits for a permit
    pub blocking_timeout: Duration,
    /// Age at which an idle connection becomes eligible for eviction.
    /// Zero disables idle removal.
    pub idle_timeout: Duration,
    /// Cadence of background liveness validation. Zero disables it.
    pub background_validation_interval: Duration,
    /// Enqueue a fill to `min_size` when the pool is constructed
    pub prefill: bool,
    /// Idle eviction stops at `min_size` instead of draining the pool
    pub strict_min: bool,
    /// A single match failure during checkout skips the rest of the
    /// inventory and goes straight to manufacturing a new connection
    pub use_fast_fail: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            min_size: 0,
            blocking_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
            background_validation_interval: Duration::ZERO,
            prefill: false,
            strict_min: false,
            use_fast_fail: false,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.blocking_timeout.is_zero() {
            return Err(Error::configuration(
                "blocking_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}
