//! Fee coin pool
//!
//! Owns the sponsor's pre-sized fee coins and issues short-lived
//! reservations against them. A coin is used by at most one transaction at
//! a time; concurrent use of the same coin version locks it on-chain until
//! the next epoch.

use crate::interfaces::{CoinInfo, RpcClient, SponsorSigner, TxCodec};
use crate::types::{ChainAddress, ObjectId, ObjectRef, TransactionData, TransactionEffects, TransactionKind};
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Reservation state of a pooled coin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoinStatus {
    /// Free for the next reservation
    Available,

    /// Claimed by an in-flight sponsorship
    Reserved,
}

impl std::fmt::Display for CoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinStatus::Available => write!(f, "Available"),
            CoinStatus::Reserved => write!(f, "Reserved"),
        }
    }
}

/// One fee coin tracked by the pool
#[derive(Debug, Clone)]
pub struct CoinEntry {
    /// The coin's latest known on-chain reference
    pub reference: ObjectRef,

    /// Balance in the chain's smallest unit
    pub balance: u64,

    /// Reservation state
    pub status: CoinStatus,

    /// When the coin became Reserved, Unix milliseconds
    pub reserved_at: Option<u64>,
}

impl CoinEntry {
    fn available(reference: ObjectRef, balance: u64) -> Self {
        Self {
            reference,
            balance,
            status: CoinStatus::Available,
            reserved_at: None,
        }
    }

    /// Stable identity of the coin
    pub fn object_id(&self) -> ObjectId {
        self.reference.object_id
    }
}

/// Caller-facing handle correlating a sponsorship with its fee coin
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Reserved coin
    pub object_id: ObjectId,

    /// When the reservation was taken, Unix milliseconds
    pub reserved_at: u64,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Tracked coins
    pub total: usize,

    /// Coins free for reservation
    pub available: usize,

    /// Coins claimed by in-flight sponsorships
    pub reserved: usize,

    /// Sum of tracked balances
    pub total_balance: u64,
}

impl PoolStats {
    /// Reserved fraction of the pool, 0.0 to 1.0
    pub fn utilization(&self) -> f64 {
        if self.total > 0 {
            self.reserved as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} total, {} available, {} reserved, {} units",
            self.total, self.available, self.reserved, self.total_balance
        )
    }
}

/// Pool parameters, fixed at construction
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of coins the pool aims to hold
    pub target_pool_size: usize,

    /// Balance each split-off coin is sized to
    pub target_coin_balance: u64,

    /// Coins below this balance are removed from the pool
    pub min_coin_balance: u64,

    /// Reservations older than this are swept to deletion (milliseconds)
    pub reservation_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_pool_size: 20,
            target_coin_balance: 500_000_000,
            min_coin_balance: 50_000_000,
            reservation_timeout_ms: 30_000,
        }
    }
}

/// The fee coin pool
///
/// Cheap to clone; clones share the same entries. All mutating operations
/// are short critical sections under one lock, so every observation sees
/// `reserved + available == total`.
#[derive(Clone)]
pub struct CoinPool {
    config: PoolConfig,
    entries: Arc<RwLock<Vec<CoinEntry>>>,
    current_time_fn: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl CoinPool {
    /// Create an empty pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(Vec::new())),
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

    /// Pool parameters
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        (self.current_time_fn)()
    }

    /// Discard all entries and repopulate from the sponsor's on-chain coins
    ///
    /// Destructive: reserved state is lost, so this must not run while
    /// sponsorships are in flight. Use [`CoinPool::replenish`] for live
    /// refills. Returns the resulting pool size.
    pub async fn initialize(
        &self,
        rpc: &dyn RpcClient,
        codec: &dyn TxCodec,
        signer: &dyn SponsorSigner,
    ) -> Result<usize> {
        let owner = signer.address();
        let coins = self.list_owned_coins(rpc, &owner).await?;
        let (usable, sources) = self.partition(coins);

        let shortfall = {
            let mut entries = self.entries.write().await;
            entries.clear();
            for coin in usable.into_iter().take(self.config.target_pool_size) {
                entries.push(CoinEntry::available(coin.reference, coin.balance));
            }
            self.config.target_pool_size - entries.len()
        };

        if shortfall == self.config.target_pool_size && sources.is_empty() {
            return Err(Error::InsufficientFunds(format!(
                "no coin owned by {owner} meets the {} unit minimum",
                self.config.min_coin_balance
            )));
        }

        if shortfall > 0 && !sources.is_empty() {
            self.split_from_sources(rpc, codec, signer, &owner, sources, shortfall)
                .await?;
        }

        let stats = self.stats().await;
        info!("coin pool initialized: {stats}");
        Ok(stats.total)
    }

    /// Top the pool up to its target size without touching existing entries
    ///
    /// Coins already tracked are skipped. Returns the number of entries
    /// added.
    pub async fn replenish(
        &self,
        rpc: &dyn RpcClient,
        codec: &dyn TxCodec,
        signer: &dyn SponsorSigner,
    ) -> Result<usize> {
        let owner = signer.address();
        let room = {
            let entries = self.entries.read().await;
            self.config.target_pool_size.saturating_sub(entries.len())
        };
        if room == 0 {
            debug!("pool is at target size; nothing to replenish");
            return Ok(0);
        }

        let coins = self.list_owned_coins(rpc, &owner).await?;
        let (usable, sources) = self.partition(coins);

        let mut added = 0;
        let (shortfall, tracked) = {
            let mut entries = self.entries.write().await;
            for coin in usable {
                if entries.len() >= self.config.target_pool_size {
                    break;
                }
                if entries
                    .iter()
                    .any(|e| e.reference.object_id == coin.reference.object_id)
                {
                    continue;
                }
                entries.push(CoinEntry::available(coin.reference, coin.balance));
                added += 1;
            }
            let tracked: HashSet<ObjectId> =
                entries.iter().map(|e| e.reference.object_id).collect();
            (
                self.config.target_pool_size.saturating_sub(entries.len()),
                tracked,
            )
        };

        if shortfall > 0 {
            let sources: Vec<CoinInfo> = sources
                .into_iter()
                .filter(|c| !tracked.contains(&c.reference.object_id))
                .collect();
            if !sources.is_empty() {
                added += self
                    .split_from_sources(rpc, codec, signer, &owner, sources, shortfall)
                    .await?;
            }
        }

        let stats = self.stats().await;
        if stats.total == 0 {
            return Err(Error::InsufficientFunds(format!(
                "no coin owned by {owner} meets the {} unit minimum",
                self.config.min_coin_balance
            )));
        }
        if added > 0 {
            info!("replenished pool with {added} coin(s): {stats}");
        }
        Ok(added)
    }

    /// Reserve the first available coin holding at least `min_balance`
    ///
    /// Expired reservations are swept before the scan. Returns a snapshot
    /// copy of the entry, or `None` when no coin qualifies.
    pub async fn reserve(&self, min_balance: Option<u64>) -> Option<CoinEntry> {
        let required = min_balance.unwrap_or(self.config.min_coin_balance);
        let now = self.now();
        let mut entries = self.entries.write().await;
        Self::sweep_locked(&mut entries, now, self.config.reservation_timeout_ms);

        let entry = entries
            .iter_mut()
            .find(|e| e.status == CoinStatus::Available && e.balance >= required)?;
        entry.status = CoinStatus::Reserved;
        entry.reserved_at = Some(now);
        debug!(
            "reserved coin {} ({} units)",
            entry.reference.object_id, entry.balance
        );
        Some(entry.clone())
    }

    /// Return a reserved coin to the pool
    ///
    /// Idempotent: releasing an unknown or already-available coin is a
    /// no-op.
    pub async fn release(&self, object_id: &ObjectId) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.reference.object_id == *object_id)
        {
            if entry.status == CoinStatus::Reserved {
                entry.status = CoinStatus::Available;
                entry.reserved_at = None;
                debug!("released coin {object_id}");
            }
        }
    }

    /// Apply a transaction's execution effects to the coin that paid for it
    ///
    /// Updates the coin's reference and balance and makes it available
    /// again, or removes it when its balance fell below the minimum or the
    /// effects belong to a different coin.
    pub async fn update_from_effects(&self, effects: &TransactionEffects, object_id: &ObjectId) {
        let mut entries = self.entries.write().await;
        let Some(pos) = entries
            .iter()
            .position(|e| e.reference.object_id == *object_id)
        else {
            debug!("effects reported for untracked coin {object_id}; ignoring");
            return;
        };

        let gas_ref = &effects.gas_object.reference;
        if gas_ref.object_id != *object_id {
            // The report touched a different coin, so this entry's on-chain
            // state is unknown and unsafe to reuse.
            warn!(
                "effects reported for coin {object_id} reference coin {}; dropping {object_id}",
                gas_ref.object_id
            );
            entries.remove(pos);
            return;
        }

        if entries[pos].reference.version >= gas_ref.version {
            // already applied; a duplicate report must not deduct twice
            debug!(
                "coin {object_id} is already at version {}; ignoring stale report",
                entries[pos].reference.version
            );
            return;
        }

        let consumed = effects.gas_used.net_usage();
        let new_balance = (entries[pos].balance as i128 - consumed).max(0) as u64;

        if new_balance < self.config.min_coin_balance {
            info!(
                "coin {object_id} at {new_balance} units after execution, below the {} minimum; removing",
                self.config.min_coin_balance
            );
            entries.remove(pos);
            return;
        }

        let entry = &mut entries[pos];
        entry.reference = gas_ref.clone();
        entry.balance = new_balance;
        entry.status = CoinStatus::Available;
        entry.reserved_at = None;
        debug!(
            "coin {object_id} now at version {} with {new_balance} units",
            gas_ref.version
        );
    }

    /// Delete reservations older than the timeout
    ///
    /// Expired coins are deleted, not recycled: the pool cannot know
    /// whether the silent client submitted the transaction, and reusing a
    /// stale reference risks equivocation. Returns the deleted coin ids.
    pub async fn sweep_expired(&self, now: u64) -> Vec<ObjectId> {
        let mut entries = self.entries.write().await;
        Self::sweep_locked(&mut entries, now, self.config.reservation_timeout_ms)
    }

    fn sweep_locked(entries: &mut Vec<CoinEntry>, now: u64, timeout_ms: u64) -> Vec<ObjectId> {
        let mut swept = Vec::new();
        entries.retain(|entry| {
            let expired = entry.status == CoinStatus::Reserved
                && entry
                    .reserved_at
                    .map(|at| now.saturating_sub(at) > timeout_ms)
                    .unwrap_or(false);
            if expired {
                warn!(
                    "reservation for coin {} expired; dropping the coin",
                    entry.reference.object_id
                );
                swept.push(entry.reference.object_id);
            }
            !expired
        });
        swept
    }

    /// Refresh every tracked coin's reference from the chain
    ///
    /// Reserved entries are skipped: their report is still pending and
    /// overwriting the stored reference mid-flight would break the report's
    /// identity check. Coins no longer on-chain are removed.
    pub async fn revalidate(&self, rpc: &dyn RpcClient) -> Result<()> {
        let ids: Vec<ObjectId> = {
            let entries = self.entries.read().await;
            entries.iter().map(|e| e.reference.object_id).collect()
        };
        if ids.is_empty() {
            return Ok(());
        }

        let snapshots = rpc.batch_get_objects(&ids).await?;

        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for (id, snapshot) in ids.iter().zip(snapshots) {
            let Some(pos) = entries.iter().position(|e| e.reference.object_id == *id) else {
                continue;
            };
            if entries[pos].status == CoinStatus::Reserved {
                continue;
            }
            match snapshot {
                Some(snapshot) => {
                    let entry = &mut entries[pos];
                    entry.reference = snapshot.reference;
                    entry.balance = snapshot.balance;
                }
                None => {
                    entries.remove(pos);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("revalidation removed {removed} coin(s) no longer on-chain");
        }
        Ok(())
    }

    /// Sweep, merge the remaining available coins into one, and clear
    ///
    /// The merge is best-effort; reserved entries are abandoned. The pool
    /// is empty afterwards regardless.
    pub async fn close(
        &self,
        rpc: &dyn RpcClient,
        codec: &dyn TxCodec,
        signer: &dyn SponsorSigner,
    ) -> Result<()> {
        let now = self.now();
        self.sweep_expired(now).await;

        let available: Vec<ObjectRef> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|e| e.status == CoinStatus::Available)
                .map(|e| e.reference.clone())
                .collect()
        };

        if available.len() >= 2 {
            if let Err(e) = self.merge_available(rpc, codec, signer, &available).await {
                warn!("close-time merge failed: {e}");
            }
        }

        let mut entries = self.entries.write().await;
        let abandoned = entries
            .iter()
            .filter(|e| e.status == CoinStatus::Reserved)
            .count();
        if abandoned > 0 {
            warn!("abandoning {abandoned} reserved coin(s) at close");
        }
        entries.clear();
        info!("coin pool closed");
        Ok(())
    }

    /// Point-in-time counters
    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        let mut stats = PoolStats {
            total: entries.len(),
            ..PoolStats::default()
        };
        for entry in entries.iter() {
            match entry.status {
                CoinStatus::Available => stats.available += 1,
                CoinStatus::Reserved => stats.reserved += 1,
            }
            stats.total_balance += entry.balance;
        }
        stats
    }

    async fn list_owned_coins(
        &self,
        rpc: &dyn RpcClient,
        owner: &ChainAddress,
    ) -> Result<Vec<CoinInfo>> {
        let mut coins = Vec::new();
        let mut cursor = None;
        loop {
            let page = rpc.list_coins(owner, cursor).await?;
            coins.extend(page.data);
            if !page.has_next_page || page.next_cursor.is_none() {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(coins)
    }

    /// Partition owned coins into pool candidates and split sources.
    /// Dust below the minimum balance is dropped.
    fn partition(&self, coins: Vec<CoinInfo>) -> (Vec<CoinInfo>, Vec<CoinInfo>) {
        let mut usable = Vec::new();
        let mut sources = Vec::new();
        for coin in coins {
            if coin.balance < self.config.min_coin_balance {
                continue;
            }
            if coin.balance > self.config.target_coin_balance * 2 {
                sources.push(coin);
            } else {
                usable.push(coin);
            }
        }
        (usable, sources)
    }

    /// Split `shortfall` fresh coins of the target balance off the source
    /// coins and admit them
    async fn split_from_sources(
        &self,
        rpc: &dyn RpcClient,
        codec: &dyn TxCodec,
        signer: &dyn SponsorSigner,
        owner: &ChainAddress,
        sources: Vec<CoinInfo>,
        shortfall: usize,
    ) -> Result<usize> {
        info!(
            "splitting {shortfall} coin(s) of {} units from {} source coin(s)",
            self.config.target_coin_balance,
            sources.len()
        );

        let amounts = vec![self.config.target_coin_balance; shortfall];
        let mut data = TransactionData::new(TransactionKind::split_gas_coin(&amounts, owner));
        data.set_sender(*owner);
        data.set_gas_owner(*owner);
        data.set_gas_payment(sources.into_iter().map(|c| c.reference).collect());
        let state = rpc.current_system_state().await?;
        data.set_gas_price(state.reference_gas_price);
        data.set_gas_budget(self.config.target_coin_balance);

        let bytes = codec.build(&data, rpc).await?;
        let signature = BASE64.encode(signer.sign(&bytes).await?);
        let response = rpc.submit_transaction(&bytes, vec![signature]).await?;

        let effects = response
            .effects
            .ok_or_else(|| Error::Rpc("coin split returned no effects".into()))?;
        if effects.created.is_empty() {
            return Err(Error::InsufficientFunds(
                "coin split created no outputs; source coins cannot cover the requested pieces"
                    .into(),
            ));
        }

        let mut entries = self.entries.write().await;
        let mut added = 0;
        for created in effects.created {
            if entries.len() >= self.config.target_pool_size {
                break;
            }
            if entries
                .iter()
                .any(|e| e.reference.object_id == created.reference.object_id)
            {
                continue;
            }
            entries.push(CoinEntry::available(
                created.reference,
                self.config.target_coin_balance,
            ));
            added += 1;
        }
        Ok(added)
    }

    async fn merge_available(
        &self,
        rpc: &dyn RpcClient,
        codec: &dyn TxCodec,
        signer: &dyn SponsorSigner,
        coins: &[ObjectRef],
    ) -> Result<()> {
        let owner = signer.address();
        let mut data =
            TransactionData::new(TransactionKind::merge_into_gas(coins[1..].to_vec()));
        data.set_sender(owner);
        data.set_gas_owner(owner);
        data.set_gas_payment(vec![coins[0].clone()]);
        let state = rpc.current_system_state().await?;
        data.set_gas_price(state.reference_gas_price);
        data.set_gas_budget(self.config.min_coin_balance);

        let bytes = codec.build(&data, rpc).await?;
        let signature = BASE64.encode(signer.sign(&bytes).await?);
        rpc.submit_transaction(&bytes, vec![signature]).await?;
        info!(
            "merged {} coin(s) into {}",
            coins.len(),
            coins[0].object_id
        );
        Ok(())
    }
}
