//! Gas station façade
//!
//! Composes the coin pool, the price cache and the policy into the public
//! sponsorship surface: initialize, sponsor, report, replenish, close.

use crate::interfaces::{RpcClient, SponsorSigner, TxCodec};
use crate::policy::{self, Policy};
use crate::pool::{CoinPool, PoolConfig, PoolStats, Reservation};
use crate::price::PriceCache;
use crate::types::{ChainAddress, ObjectId, ObjectRef, TransactionData, TransactionEffects};
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Best-effort notification that the pool ran out of available coins.
/// Diagnostic only; it carries no control flow.
pub type DepletionCallback = Arc<dyn Fn(PoolStats) + Send + Sync>;

/// Gas station configuration
#[derive(Debug, Clone)]
pub struct GasStationConfig {
    /// Number of fee coins the pool aims to hold
    pub target_pool_size: usize,

    /// Balance each split-off fee coin is sized to
    pub target_coin_balance: u64,

    /// Coins below this balance are removed from the pool
    pub min_coin_balance: u64,

    /// Reservations older than this are swept to deletion (milliseconds)
    pub reservation_timeout_ms: u64,

    /// Quiet window around the epoch boundary (milliseconds)
    pub epoch_boundary_window_ms: u64,

    /// Interval of the background expiry sweep (milliseconds)
    pub sweep_interval_ms: u64,

    /// Interval of the background refill (milliseconds)
    pub replenish_interval_ms: u64,
}

impl Default for GasStationConfig {
    fn default() -> Self {
        Self {
            target_pool_size: 20,
            target_coin_balance: 500_000_000,
            min_coin_balance: 50_000_000,
            reservation_timeout_ms: 30_000,
            epoch_boundary_window_ms: crate::price::DEFAULT_EPOCH_BOUNDARY_WINDOW_MS,
            sweep_interval_ms: 10_000,
            replenish_interval_ms: 60_000,
        }
    }
}

impl GasStationConfig {
    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            target_pool_size: self.target_pool_size,
            target_coin_balance: self.target_coin_balance,
            min_coin_balance: self.min_coin_balance,
            reservation_timeout_ms: self.reservation_timeout_ms,
        }
    }
}

/// A sender-intent to sponsor
#[derive(Debug, Clone)]
pub struct SponsorRequest {
    /// Sender address, hex form
    pub sender: String,

    /// Base64-encoded transaction body (operations without gas data)
    pub transaction_kind: String,

    /// Requested gas budget; the policy or pool default applies when absent
    pub gas_budget: Option<u64>,
}

/// Wire-ready sponsorship result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsoredTransaction {
    /// Base64 of the full, unsigned wire-format transaction
    pub transaction_bytes: String,

    /// Base64 of the sponsor's signature over those bytes
    pub sponsor_signature: String,

    /// Budget of the built transaction
    pub gas_budget: u64,

    /// Reference price the transaction was built against
    pub gas_price: u64,

    /// Handle for the follow-up execution report
    pub reservation: Reservation,
}

/// Releases a reserved coin when a sponsorship is abandoned mid-flight
///
/// Error paths release explicitly; the drop path covers cancellation,
/// where the only option is to hand the release to the runtime.
struct ReservationGuard {
    pool: CoinPool,
    object_id: ObjectId,
    armed: bool,
}

impl ReservationGuard {
    fn new(pool: CoinPool, object_id: ObjectId) -> Self {
        Self {
            pool,
            object_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = self.pool.clone();
        let object_id = self.object_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                warn!("sponsorship dropped mid-flight; releasing coin {object_id}");
                pool.release(&object_id).await;
            });
        }
    }
}

/// The gas sponsorship service
///
/// One instance per sponsor key. Safe to share across request handlers;
/// all mutable state lives behind the pool and price-cache locks.
pub struct GasStation {
    config: GasStationConfig,
    rpc: Arc<dyn RpcClient>,
    signer: Arc<dyn SponsorSigner>,
    codec: Arc<dyn TxCodec>,
    policy: Option<Policy>,
    on_pool_depleted: Option<DepletionCallback>,
    pool: CoinPool,
    price_cache: PriceCache,
    initialized: AtomicBool,
}

impl GasStation {
    /// Create a gas station over the injected collaborators
    pub fn new(
        config: GasStationConfig,
        rpc: Arc<dyn RpcClient>,
        signer: Arc<dyn SponsorSigner>,
        codec: Arc<dyn TxCodec>,
    ) -> Self {
        let pool = CoinPool::new(config.pool_config());
        let price_cache = PriceCache::new(config.epoch_boundary_window_ms);
        Self {
            config,
            rpc,
            signer,
            codec,
            policy: None,
            on_pool_depleted: None,
            pool,
            price_cache,
            initialized: AtomicBool::new(false),
        }
    }

    /// Attach a sponsorship policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Register the pool-depletion callback
    pub fn with_depletion_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(PoolStats) + Send + Sync + 'static,
    {
        self.on_pool_depleted = Some(Arc::new(callback));
        self
    }

    /// Build the coin pool from the sponsor's holdings and prime the price
    /// cache
    ///
    /// Destructive on the pool; must not run while sponsorships are in
    /// flight.
    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .initialize(self.rpc.as_ref(), self.codec.as_ref(), self.signer.as_ref())
            .await?;
        self.price_cache
            .refresh(self.rpc.as_ref(), &self.pool)
            .await?;
        self.initialized.store(true, Ordering::Release);
        info!("gas station initialized for sponsor {}", self.signer.address());
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Sponsor one sender-intent
    ///
    /// Attaches a reserved fee coin and the current reference price, signs
    /// as sponsor and returns wire-ready bytes. On any failure after the
    /// reservation the coin is released before the error propagates.
    pub async fn sponsor_transaction(&self, request: SponsorRequest) -> Result<SponsoredTransaction> {
        self.ensure_initialized()?;

        let sender: ChainAddress = request.sender.parse()?;

        let price = self.price_cache.get(self.rpc.as_ref(), &self.pool).await?;

        let body = BASE64
            .decode(&request.transaction_kind)
            .map_err(|e| Error::BuildFailed(format!("transaction body is not valid base64: {e}")))?;
        let parsed = self.codec.parse_kind(&body)?;

        if let Some(policy) = &self.policy {
            policy::validate(policy, &sender, &parsed.kind, request.gas_budget.unwrap_or(0))?;
        }

        let Some(coin) = self.pool.reserve(request.gas_budget).await else {
            let stats = self.pool.stats().await;
            warn!("coin pool exhausted ({stats})");
            self.notify_depleted(stats);
            return Err(Error::PoolExhausted {
                required: request.gas_budget.unwrap_or(self.config.min_coin_balance),
            });
        };

        let stats = self.pool.stats().await;
        if stats.available == 0 {
            debug!(
                "last available coin reserved, pool at {:.0}% utilization",
                stats.utilization() * 100.0
            );
            self.notify_depleted(stats);
        }

        let mut guard = ReservationGuard::new(self.pool.clone(), coin.object_id());
        let reservation = Reservation {
            object_id: coin.object_id(),
            reserved_at: coin.reserved_at.unwrap_or_default(),
        };

        let result = self
            .build_and_sign(parsed, sender, &coin.reference, price, request.gas_budget)
            .await;
        guard.disarm();

        match result {
            Ok((transaction_bytes, sponsor_signature, gas_budget)) => {
                info!(
                    "sponsored transaction for {sender} with coin {} (budget {gas_budget}, price {price})",
                    reservation.object_id
                );
                Ok(SponsoredTransaction {
                    transaction_bytes,
                    sponsor_signature,
                    gas_budget,
                    gas_price: price,
                    reservation,
                })
            }
            Err(e) => {
                self.pool.release(&reservation.object_id).await;
                Err(e)
            }
        }
    }

    async fn build_and_sign(
        &self,
        mut data: TransactionData,
        sender: ChainAddress,
        coin_reference: &ObjectRef,
        price: u64,
        gas_budget: Option<u64>,
    ) -> Result<(String, String, u64)> {
        let allow_gas_coin = self
            .policy
            .as_ref()
            .map(|p| p.allows_gas_coin_usage())
            .unwrap_or(false);
        if !allow_gas_coin {
            policy::ensure_gas_coin_untouched(data.commands())?;
        }

        data.set_sender(sender);
        data.set_gas_owner(self.signer.address());
        data.set_gas_payment(vec![coin_reference.clone()]);
        data.set_gas_price(price);

        // ceiling for the codec's dry-run, bounding worst-case spend
        let ceiling = gas_budget
            .or_else(|| self.policy.as_ref().and_then(|p| p.max_budget_per_tx()))
            .unwrap_or(self.config.target_coin_balance);
        data.set_gas_budget(ceiling);

        let bytes = self.codec.build(&data, self.rpc.as_ref()).await?;
        let sponsor_signature = BASE64.encode(self.signer.sign(&bytes).await?);

        // the build step may auto-estimate a budget below the ceiling
        let built = self.codec.parse_full(&bytes)?;
        let gas_budget = built.gas_data().budget.unwrap_or(ceiling);

        if let Some(cap) = self.policy.as_ref().and_then(|p| p.max_budget_per_tx()) {
            if gas_budget > cap {
                return Err(Error::PolicyViolation(format!(
                    "built transaction budget {gas_budget} exceeds the per-transaction cap {cap}"
                )));
            }
        }

        Ok((BASE64.encode(&bytes), sponsor_signature, gas_budget))
    }

    /// Report a sponsored transaction's execution effects
    ///
    /// Updates the reserved coin so it can be reused. Idempotent: a repeat
    /// report for the same reservation is a no-op.
    pub async fn report_execution(
        &self,
        reservation: &Reservation,
        effects: &serde_json::Value,
    ) -> Result<()> {
        self.ensure_initialized()?;

        let has_reference = effects
            .get("gasObject")
            .and_then(|gas| gas.get("reference"))
            .is_some();
        if !has_reference || effects.get("gasUsed").is_none() {
            return Err(Error::InvalidEffects(
                "effects must carry gasObject.reference and gasUsed".into(),
            ));
        }

        let effects: TransactionEffects = serde_json::from_value(effects.clone())
            .map_err(|e| Error::InvalidEffects(e.to_string()))?;

        self.pool
            .update_from_effects(&effects, &reservation.object_id)
            .await;
        Ok(())
    }

    /// Top the pool back up to its target size
    pub async fn replenish(&self) -> Result<usize> {
        self.ensure_initialized()?;
        self.pool
            .replenish(self.rpc.as_ref(), self.codec.as_ref(), self.signer.as_ref())
            .await
    }

    /// Merge the remaining coins and shut the pool down
    pub async fn close(&self) -> Result<()> {
        self.pool
            .close(self.rpc.as_ref(), self.codec.as_ref(), self.signer.as_ref())
            .await?;
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    /// Current pool counters
    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    fn notify_depleted(&self, stats: PoolStats) {
        if let Some(callback) = &self.on_pool_depleted {
            callback(stats);
        }
    }

    /// Start the periodic expiry sweep and refill loops
    pub fn start_background_tasks(self: Arc<Self>) {
        let station = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(
                    station.config.sweep_interval_ms,
                ))
                .await;
                if station.ensure_initialized().is_err() {
                    continue;
                }
                let now = unix_now_ms();
                let swept = station.pool.sweep_expired(now).await;
                if !swept.is_empty() {
                    warn!("background sweep dropped {} expired coin(s)", swept.len());
                }
            }
        });

        let station = self;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(
                    station.config.replenish_interval_ms,
                ))
                .await;
                if station.ensure_initialized().is_err() {
                    continue;
                }
                if let Err(e) = station.replenish().await {
                    error!("background replenish failed: {e}");
                }
            }
        });

        info!("gas station background tasks started");
    }
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
