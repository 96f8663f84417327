//! Background validation tests: stale selection, restamping, destruction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use quiver_pool::{ManagedConnectionFactory, Pool, PoolConfig, Result};

struct ValidatingFactory {
    serial: AtomicU64,
    validating: bool,
    healthy: AtomicBool,
}

impl ValidatingFactory {
    fn new(validating: bool) -> Self {
        Self {
            serial: AtomicU64::new(0),
            validating,
            healthy: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ManagedConnectionFactory for ValidatingFactory {
    type Connection = u64;
    type Subject = ();
    type RequestInfo = ();

    async fn create(&self, _subject: &(), _request: &()) -> Result<u64> {
        Ok(self.serial.fetch_add(1, Ordering::SeqCst))
    }

    async fn matches(&self, _conn: &u64, _subject: &(), _request: &()) -> Result<bool> {
        Ok(true)
    }

    async fn cleanup(&self, _conn: &mut u64) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, _conn: u64) -> Result<()> {
        Ok(())
    }

    fn supports_validation(&self) -> bool {
        self.validating
    }

    async fn is_valid(&self, _conn: &u64) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

fn config(interval: Duration, min_size: usize) -> PoolConfig {
    PoolConfig {
        max_size: 4,
        min_size,
        blocking_timeout: Duration::from_secs(1),
        idle_timeout: Duration::ZERO,
        background_validation_interval: interval,
        prefill: false,
        strict_min: false,
        use_fast_fail: false,
    }
}

async fn park_connections(pool: &Pool<ValidatingFactory>, n: usize) {
    let mut held = Vec::new();
    for _ in 0..n {
        held.push(pool.checkout(None, None).await.unwrap());
    }
    for cl in held {
        pool.return_connection(cl, false).await;
    }
}

#[tokio::test]
async fn dead_connections_are_destroyed() {
    let factory = ValidatingFactory::new(true);
    let pool = Pool::new(factory, (), (), config(Duration::from_millis(100), 0)).unwrap();

    park_connections(&pool, 2).await;
    pool.factory().healthy.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.validate_connections().await;

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 2, "both dead connections destroyed");
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.available_permits, 4, "validation permit must be released");
}

#[tokio::test]
async fn healthy_connections_are_restamped_and_kept() {
    let factory = ValidatingFactory::new(true);
    let pool = Pool::new(factory, (), (), config(Duration::from_millis(100), 0)).unwrap();

    park_connections(&pool, 2).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.validate_connections().await;

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 0);
    assert_eq!(stats.idle, 2);

    // Freshly restamped: an immediate second pass finds nothing stale.
    pool.validate_connections().await;
    assert_eq!(pool.stats().idle, 2);
}

#[tokio::test]
async fn destroyed_connections_are_refilled_to_min() {
    let factory = ValidatingFactory::new(true);
    let pool = Pool::new(factory, (), (), config(Duration::from_millis(100), 1)).unwrap();

    park_connections(&pool, 2).await;
    pool.factory().healthy.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.validate_connections().await;
    assert!(pool.stats().destroyed >= 2);

    // Let the filler restore the floor, then stop the churn.
    pool.factory().healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        pool.stats().idle + pool.stats().active >= 1,
        "filler should restore min_size"
    );
}

#[tokio::test]
async fn non_validating_factory_leaves_connections_alone() {
    let factory = ValidatingFactory::new(false);
    let pool = Pool::new(factory, (), (), config(Duration::from_millis(100), 0)).unwrap();

    // The health flag claims dead, but the factory cannot validate.
    park_connections(&pool, 2).await;
    pool.factory().healthy.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.validate_connections().await;

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 0, "no state change without the capability");
    assert_eq!(stats.idle, 2);
}

#[tokio::test]
async fn validation_disabled_is_a_no_op() {
    let factory = ValidatingFactory::new(true);
    let pool = Pool::new(factory, (), (), config(Duration::ZERO, 0)).unwrap();

    park_connections(&pool, 2).await;
    pool.factory().healthy.store(false, Ordering::SeqCst);
    pool.validate_connections().await;

    assert_eq!(pool.stats().destroyed, 0);
    assert_eq!(pool.stats().idle, 2);
}
