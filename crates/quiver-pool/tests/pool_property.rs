//! Property tests for the pool's quantified invariants.
//!
//! After every completed operation: `idle + active <= max_size`, and
//! `available_permits + held_permits == max_size`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use quiver_pool::{ManagedConnectionFactory, Pool, PoolConfig, Result};

struct CountingFactory {
    serial: AtomicU64,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            serial: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ManagedConnectionFactory for CountingFactory {
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
}

fn pool_config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        min_size: 0,
        blocking_timeout: Duration::from_millis(10),
        idle_timeout: Duration::ZERO,
        background_validation_interval: Duration::ZERO,
        prefill: false,
        strict_min: false,
        use_fast_fail: false,
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Checkout,
    Return { kill: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => Just(Op::Checkout),
        2 => Just(Op::Return { kill: false }),
        1 => Just(Op::Return { kill: true }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn invariants_hold_after_every_operation(
        max_size in 1usize..6,
        ops in proptest::collection::vec(op_strategy(), 1..24),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let pool = Pool::new(CountingFactory::new(), (), (), pool_config(max_size)).unwrap();
            let mut held = Vec::new();

            for op in &ops {
                match op {
                    Op::Checkout => {
                        // May time out when the pool is exhausted; that is fine.
                        if let Ok(cl) = pool.checkout(None, None).await {
                            held.push(cl);
                        }
                    }
                    Op::Return { kill } => {
                        if let Some(cl) = held.pop() {
                            pool.return_connection(cl, *kill).await;
                        }
                    }
                }

                let stats = pool.stats();
                prop_assert!(
                    stats.idle + stats.active <= max_size,
                    "capacity bound violated: idle={} active={} max={}",
                    stats.idle, stats.active, max_size,
                );
                prop_assert_eq!(
                    stats.available_permits + stats.held_permits, max_size,
                    "permit conservation violated: available={} held={}",
                    stats.available_permits, stats.held_permits,
                );
            }

            // Drain: return everything and verify the quiescent state.
            while let Some(cl) = held.pop() {
                pool.return_connection(cl, false).await;
            }
            let stats = pool.stats();
            prop_assert_eq!(stats.active, 0);
            prop_assert_eq!(stats.held_permits, 0);
            prop_assert_eq!(stats.available_permits, max_size);
            prop_assert!(stats.idle <= max_size);

            Ok(())
        })?;
    }
}

/// Deterministic spot check of the reuse law: a get/return/get cycle serves
/// the same connection without manufacturing a second one.
#[tokio::test]
async fn reuse_law_holds() {
    let pool = Pool::new(CountingFactory::new(), (), (), pool_config(3)).unwrap();

    for _ in 0..10 {
        let cl = pool.checkout(None, None).await.unwrap();
        pool.return_connection(cl, false).await;
    }

    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.max_used, 1);
    assert_eq!(pool.max_used_connections(), 1);
}

/// Destroy is idempotent: killing the same connection through every
/// available path has the effect of a single destroy.
#[tokio::test]
async fn destroy_is_idempotent() {
    let pool = Pool::new(CountingFactory::new(), (), (), pool_config(2)).unwrap();

    let cl = pool.checkout(None, None).await.unwrap();
    pool.return_connection(cl.clone(), true).await;
    pool.return_connection(cl.clone(), true).await;
    pool.flush().await;

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 1, "one connection, one destroy");
    assert_eq!(stats.available_permits, 2);
}
