//! Epoch-aware reference price cache
//!
//! The chain's reference fee price is constant within an epoch. The cache
//! holds one fetched price together with the epoch's expected end, and
//! suspends callers that arrive inside the boundary window instead of
//! serving a price that is about to change.

use crate::interfaces::RpcClient;
use crate::pool::CoinPool;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Quiet window around the epoch boundary, milliseconds
pub const DEFAULT_EPOCH_BOUNDARY_WINDOW_MS: u64 = 1_000;

/// Longest a caller is suspended waiting out an epoch boundary
///
/// Caps the wait under clock skew between this process and the chain.
pub const MAX_BOUNDARY_WAIT_MS: u64 = 30_000;

/// One fetched price. Replaced on refresh, never mutated in place.
#[derive(Debug, Clone)]
struct PriceEntry {
    price: u64,
    epoch: u64,
    expiration_ms: u64,
    fetched_at_ms: u64,
}

/// Cache for the network's reference fee price
pub struct PriceCache {
    entry: RwLock<Option<PriceEntry>>,
    needs_revalidation: AtomicBool,
    boundary_window_ms: u64,
    current_time_fn: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl PriceCache {
    /// Create an empty cache
    pub fn new(boundary_window_ms: u64) -> Self {
        Self {
            entry: RwLock::new(None),
            needs_revalidation: AtomicBool::new(false),
            boundary_window_ms,
            current_time_fn: Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_millis() as u64
            }),
        }
    }

    /// Set the current time function (for testing)
    pub fn with_time_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.current_time_fn = Arc::new(f);
        self
    }

    fn now(&self) -> u64 {
        (self.current_time_fn)()
    }

    /// Current reference price
    ///
    /// Serves the cached price while the epoch is live; suspends through
    /// the boundary window when the epoch is about to roll, then refreshes.
    /// A previously failed pool revalidation is retried first, best-effort.
    pub async fn get(&self, rpc: &dyn RpcClient, pool: &CoinPool) -> Result<u64> {
        if self.needs_revalidation.load(Ordering::Acquire) {
            match pool.revalidate(rpc).await {
                Ok(()) => {
                    self.needs_revalidation.store(false, Ordering::Release);
                    info!("deferred pool revalidation completed");
                }
                Err(e) => warn!("deferred pool revalidation failed again: {e}"),
            }
        }

        let cached = self.entry.read().await.clone();
        if let Some(entry) = cached {
            let now = self.now();
            if now + self.boundary_window_ms < entry.expiration_ms {
                return Ok(entry.price);
            }
            if now < entry.expiration_ms + self.boundary_window_ms {
                let wait_ms = (entry.expiration_ms + self.boundary_window_ms - now)
                    .max(1_000)
                    .min(MAX_BOUNDARY_WAIT_MS);
                debug!("epoch boundary ahead; waiting {wait_ms} ms before refreshing");
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }

        self.refresh(rpc, pool).await
    }

    /// Fetch the current system state and replace the cached entry
    ///
    /// An epoch change triggers a pool revalidation; if that fails, the
    /// retry flag is set instead of surfacing the error.
    pub async fn refresh(&self, rpc: &dyn RpcClient, pool: &CoinPool) -> Result<u64> {
        let state = rpc.current_system_state().await?;
        let now = self.now();
        let entry = PriceEntry {
            price: state.reference_gas_price,
            epoch: state.epoch,
            // stays ahead of the fetch time even under clock skew
            expiration_ms: (state.epoch_start_ms + state.epoch_duration_ms).max(now + 1),
            fetched_at_ms: now,
        };

        debug!(
            "reference price {} cached for epoch {}, {} ms to expiry",
            entry.price,
            entry.epoch,
            entry.expiration_ms - entry.fetched_at_ms
        );

        let previous_epoch = {
            let mut cached = self.entry.write().await;
            cached.replace(entry).map(|prev| prev.epoch)
        };

        if let Some(previous) = previous_epoch {
            if previous != state.epoch {
                info!("epoch changed {previous} -> {}; revalidating pool", state.epoch);
                if let Err(e) = pool.revalidate(rpc).await {
                    warn!("pool revalidation after epoch change failed: {e}");
                    self.needs_revalidation.store(true, Ordering::Release);
                }
            }
        }

        Ok(state.reference_gas_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::SystemState;
    use crate::pool::PoolConfig;
    use crate::testing::MockRpc;

    use std::sync::atomic::AtomicU64;

    fn state(epoch: u64, price: u64, start_ms: u64, duration_ms: u64) -> SystemState {
        SystemState {
            epoch,
            reference_gas_price: price,
            epoch_start_ms: start_ms,
            epoch_duration_ms: duration_ms,
        }
    }

    fn cache_at(start_ms: u64) -> (PriceCache, Arc<AtomicU64>) {
        let clock = Arc::new(AtomicU64::new(start_ms));
        let time = clock.clone();
        let cache = PriceCache::new(DEFAULT_EPOCH_BOUNDARY_WINDOW_MS)
            .with_time_fn(move || time.load(Ordering::SeqCst));
        (cache, clock)
    }

    #[tokio::test]
    async fn test_get_serves_cached_price_within_epoch() {
        let (cache, _clock) = cache_at(10_000);
        let pool = CoinPool::new(PoolConfig::default());
        let rpc = MockRpc::new();
        rpc.set_system_state(state(1, 750, 0, 100_000)).await;

        assert_eq!(cache.get(&rpc, &pool).await.unwrap(), 750);
        assert_eq!(rpc.system_state_calls(), 1);

        // second read is served from the cache
        assert_eq!(cache.get(&rpc, &pool).await.unwrap(), 750);
        assert_eq!(rpc.system_state_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_waits_through_epoch_boundary() {
        // epoch ends at t = 100_000; the caller arrives at t = 99_800,
        // inside the 1 s boundary window
        let (cache, clock) = cache_at(10_000);
        let pool = CoinPool::new(PoolConfig::default());
        let rpc = MockRpc::new();
        rpc.set_system_state(state(1, 750, 0, 100_000)).await;
        cache.refresh(&rpc, &pool).await.unwrap();

        clock.store(99_800, Ordering::SeqCst);
        rpc.set_system_state(state(2, 800, 100_000, 100_000)).await;

        let started = tokio::time::Instant::now();
        let price = cache.get(&rpc, &pool).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(price, 800);
        // expiration + window - now = 1_200 ms
        assert_eq!(waited, Duration::from_millis(1_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_wait_never_drops_below_one_second() {
        // the caller arrives 500 ms before the end of the window; the wait
        // is still floored at 1 s
        let (cache, clock) = cache_at(10_000);
        let pool = CoinPool::new(PoolConfig::default());
        let rpc = MockRpc::new();
        rpc.set_system_state(state(1, 750, 0, 100_000)).await;
        cache.refresh(&rpc, &pool).await.unwrap();

        clock.store(100_500, Ordering::SeqCst);

        let started = tokio::time::Instant::now();
        cache.get(&rpc, &pool).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(waited, Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_stale_cache_past_window_refreshes_without_wait() {
        let (cache, clock) = cache_at(10_000);
        let pool = CoinPool::new(PoolConfig::default());
        let rpc = MockRpc::new();
        rpc.set_system_state(state(1, 750, 0, 100_000)).await;
        cache.refresh(&rpc, &pool).await.unwrap();

        clock.store(500_000, Ordering::SeqCst);
        rpc.set_system_state(state(5, 900, 500_000, 100_000)).await;
        assert_eq!(cache.get(&rpc, &pool).await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_epoch_change_revalidates_pool() {
        use crate::testing::{coin, JsonCodec, MockSigner};

        let (cache, _clock) = cache_at(1_000);
        let pool = CoinPool::new(PoolConfig::default());
        let rpc = MockRpc::new();
        rpc.add_coin(coin(1, 500_000_000)).await;
        rpc.set_system_state(state(1, 750, 0, 3_600_000)).await;
        pool.initialize(&rpc, &JsonCodec, &MockSigner::sponsor())
            .await
            .unwrap();

        cache.refresh(&rpc, &pool).await.unwrap();
        assert_eq!(rpc.batch_get_calls(), 0);

        // same epoch: no revalidation
        cache.refresh(&rpc, &pool).await.unwrap();
        assert_eq!(rpc.batch_get_calls(), 0);

        rpc.set_system_state(state(2, 800, 0, 3_600_000)).await;
        cache.refresh(&rpc, &pool).await.unwrap();
        assert_eq!(rpc.batch_get_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_revalidation_is_retried_on_get() {
        use crate::testing::{coin, JsonCodec, MockSigner};

        let cache = PriceCache::new(DEFAULT_EPOCH_BOUNDARY_WINDOW_MS).with_time_fn(|| 1_000);
        let pool = CoinPool::new(PoolConfig::default());
        let rpc = MockRpc::new();
        rpc.add_coin(coin(1, 500_000_000)).await;
        rpc.set_system_state(state(1, 750, 0, 3_600_000)).await;
        pool.initialize(&rpc, &JsonCodec, &MockSigner::sponsor())
            .await
            .unwrap();

        cache.refresh(&rpc, &pool).await.unwrap();

        // epoch rolls while the batch endpoint is down
        rpc.set_system_state(state(2, 800, 0, 3_600_000)).await;
        rpc.fail_batch_get(true);
        cache.refresh(&rpc, &pool).await.unwrap();
        assert!(cache.needs_revalidation.load(Ordering::Acquire));

        // next get retries the revalidation once the endpoint recovers
        rpc.fail_batch_get(false);
        cache.get(&rpc, &pool).await.unwrap();
        assert!(!cache.needs_revalidation.load(Ordering::Acquire));
        assert!(rpc.batch_get_calls() >= 1);
    }
}
