//! Shared test doubles
//!
//! A scriptable RPC client, deterministic signers and a JSON-backed codec
//! whose built bytes are honest, re-parseable transactions.

use crate::interfaces::{
    CoinInfo, CoinPage, ObjectSnapshot, RpcClient, SponsorSigner, SubmitResponse, SystemState,
    TxCodec,
};
use crate::types::{
    ChainAddress, CreatedObject, GasObject, GasUsed, ObjectDigest, ObjectId, ObjectRef,
    TransactionData, TransactionEffects, TransactionKind, ADDRESS_LENGTH,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

pub fn id(seed: u8) -> ObjectId {
    ObjectId::new([seed; ADDRESS_LENGTH])
}

pub fn digest(version: u64) -> ObjectDigest {
    ObjectDigest::new(format!("digest-{version}"))
}

/// A coin at version 1 with a seeded identity
pub fn coin(seed: u8, balance: u64) -> CoinInfo {
    CoinInfo {
        reference: ObjectRef::new(id(seed), 1, digest(1)),
        balance,
    }
}

pub fn effects_with(gas_id: ObjectId, version: u64, gas_used: GasUsed) -> TransactionEffects {
    TransactionEffects {
        gas_object: GasObject {
            reference: ObjectRef::new(gas_id, version, digest(version)),
        },
        gas_used,
        created: Vec::new(),
    }
}

/// Effects in the chain's JSON convention (decimal-string numerics)
pub fn effects_json(
    gas_id: ObjectId,
    version: u64,
    computation: u64,
    storage: u64,
    rebate: u64,
) -> serde_json::Value {
    serde_json::json!({
        "gasObject": {
            "reference": {
                "objectId": gas_id.to_string(),
                "version": version.to_string(),
                "digest": format!("digest-{version}"),
            }
        },
        "gasUsed": {
            "computationCost": computation.to_string(),
            "storageCost": storage.to_string(),
            "storageRebate": rebate.to_string(),
        }
    })
}

pub fn body_bytes(kind: &TransactionKind) -> Vec<u8> {
    serde_json::to_vec(kind).expect("transaction kind serializes")
}

/// Scriptable RPC client
///
/// Coins are listed two per page to exercise pagination.
pub struct MockRpc {
    coins: Mutex<Vec<CoinInfo>>,
    objects: Mutex<HashMap<ObjectId, Option<ObjectSnapshot>>>,
    system_state: Mutex<Option<SystemState>>,
    created_on_submit: Mutex<Vec<CoinInfo>>,
    submitted: Mutex<Vec<Vec<u8>>>,
    system_state_count: AtomicUsize,
    batch_get_count: AtomicUsize,
    batch_get_down: AtomicBool,
}

const PAGE_SIZE: usize = 2;

impl MockRpc {
    pub fn new() -> Self {
        Self {
            coins: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            // a long-lived epoch so tests never straddle the boundary
            // unless they script one
            system_state: Mutex::new(Some(SystemState {
                epoch: 1,
                reference_gas_price: 750,
                epoch_start_ms: 0,
                epoch_duration_ms: 10_000_000_000_000,
            })),
            created_on_submit: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            system_state_count: AtomicUsize::new(0),
            batch_get_count: AtomicUsize::new(0),
            batch_get_down: AtomicBool::new(false),
        }
    }

    pub async fn add_coin(&self, coin: CoinInfo) {
        self.coins.lock().await.push(coin);
    }

    pub async fn set_object(&self, id: ObjectId, snapshot: Option<ObjectSnapshot>) {
        self.objects.lock().await.insert(id, snapshot);
    }

    pub async fn set_system_state(&self, state: SystemState) {
        *self.system_state.lock().await = Some(state);
    }

    /// Coins the next submitted transaction reports as created
    pub async fn set_created_on_submit(&self, coins: Vec<CoinInfo>) {
        *self.created_on_submit.lock().await = coins;
    }

    pub async fn submitted_count(&self) -> usize {
        self.submitted.lock().await.len()
    }

    pub fn system_state_calls(&self) -> usize {
        self.system_state_count.load(Ordering::SeqCst)
    }

    pub fn batch_get_calls(&self) -> usize {
        self.batch_get_count.load(Ordering::SeqCst)
    }

    pub fn fail_batch_get(&self, down: bool) {
        self.batch_get_down.store(down, Ordering::SeqCst);
    }
}

impl Default for MockRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn list_coins(&self, _owner: &ChainAddress, cursor: Option<String>) -> Result<CoinPage> {
        let coins = self.coins.lock().await;
        let start: usize = cursor
            .map(|c| c.parse().expect("mock cursor is an index"))
            .unwrap_or(0);
        let end = (start + PAGE_SIZE).min(coins.len());
        let has_next_page = end < coins.len();
        Ok(CoinPage {
            data: coins[start..end].to_vec(),
            next_cursor: has_next_page.then(|| end.to_string()),
            has_next_page,
        })
    }

    async fn batch_get_objects(&self, ids: &[ObjectId]) -> Result<Vec<Option<ObjectSnapshot>>> {
        if self.batch_get_down.load(Ordering::SeqCst) {
            return Err(Error::Rpc("batch endpoint is down".into()));
        }
        self.batch_get_count.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().await;
        Ok(ids
            .iter()
            .map(|id| objects.get(id).cloned().flatten())
            .collect())
    }

    async fn current_system_state(&self) -> Result<SystemState> {
        self.system_state_count.fetch_add(1, Ordering::SeqCst);
        self.system_state
            .lock()
            .await
            .ok_or_else(|| Error::Rpc("system state unavailable".into()))
    }

    async fn submit_transaction(
        &self,
        transaction_bytes: &[u8],
        _signatures: Vec<String>,
    ) -> Result<SubmitResponse> {
        self.submitted.lock().await.push(transaction_bytes.to_vec());
        let created = self
            .created_on_submit
            .lock()
            .await
            .iter()
            .map(|coin| CreatedObject {
                reference: coin.reference.clone(),
            })
            .collect();
        Ok(SubmitResponse {
            digest: "mock-digest".into(),
            effects: Some(TransactionEffects {
                gas_object: GasObject {
                    reference: ObjectRef::new(id(0), 1, digest(1)),
                },
                gas_used: GasUsed::default(),
                created,
            }),
        })
    }
}

/// Signer with a fixed sponsor address and deterministic signatures
pub struct MockSigner {
    address: ChainAddress,
}

impl MockSigner {
    pub fn sponsor() -> Self {
        Self {
            address: ChainAddress::new([0xAA; ADDRESS_LENGTH]),
        }
    }
}

#[async_trait]
impl SponsorSigner for MockSigner {
    fn address(&self) -> ChainAddress {
        self.address
    }

    async fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut signature = b"mock-signature-".to_vec();
        signature.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        Ok(signature)
    }
}

/// Signer that refuses every request
pub struct FailingSigner;

#[async_trait]
impl SponsorSigner for FailingSigner {
    fn address(&self) -> ChainAddress {
        ChainAddress::new([0xAA; ADDRESS_LENGTH])
    }

    async fn sign(&self, _bytes: &[u8]) -> Result<Vec<u8>> {
        Err(Error::SignFailed("mock signer refused".into()))
    }
}

/// Codec over the crate's own serde representation
pub struct JsonCodec;

#[async_trait]
impl TxCodec for JsonCodec {
    fn parse_kind(&self, bytes: &[u8]) -> Result<TransactionData> {
        let kind: TransactionKind = serde_json::from_slice(bytes)
            .map_err(|e| Error::BuildFailed(format!("unparseable transaction body: {e}")))?;
        Ok(TransactionData::new(kind))
    }

    fn parse_full(&self, bytes: &[u8]) -> Result<TransactionData> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::BuildFailed(format!("unparseable transaction: {e}")))
    }

    async fn build(&self, transaction: &TransactionData, _rpc: &dyn RpcClient) -> Result<Vec<u8>> {
        serde_json::to_vec(transaction).map_err(|e| Error::BuildFailed(e.to_string()))
    }
}

/// Codec whose dry-run always lands on a fixed budget
pub struct BudgetCodec {
    pub built_budget: u64,
}

#[async_trait]
impl TxCodec for BudgetCodec {
    fn parse_kind(&self, bytes: &[u8]) -> Result<TransactionData> {
        JsonCodec.parse_kind(bytes)
    }

    fn parse_full(&self, bytes: &[u8]) -> Result<TransactionData> {
        JsonCodec.parse_full(bytes)
    }

    async fn build(&self, transaction: &TransactionData, rpc: &dyn RpcClient) -> Result<Vec<u8>> {
        let mut transaction = transaction.clone();
        transaction.set_gas_budget(self.built_budget);
        JsonCodec.build(&transaction, rpc).await
    }
}
