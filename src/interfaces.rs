//! Injected collaborator interfaces
//!
//! The gas station takes its chain access, signing key and transaction
//! codec as trait objects. Implementations live outside this crate; the
//! station only relies on the contracts below.

use crate::types::{ChainAddress, ObjectId, ObjectRef, TransactionData, TransactionEffects};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One coin from the sponsor's on-chain holdings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinInfo {
    /// The coin's current on-chain reference
    pub reference: ObjectRef,

    /// Balance in the chain's smallest unit
    pub balance: u64,
}

/// One page of a coin listing
#[derive(Debug, Clone, Default)]
pub struct CoinPage {
    /// Coins on this page
    pub data: Vec<CoinInfo>,

    /// Cursor for the next page
    pub next_cursor: Option<String>,

    /// Whether more pages follow
    pub has_next_page: bool,
}

/// Current state of an object fetched by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSnapshot {
    /// The object's current reference
    pub reference: ObjectRef,

    /// Coin balance read from the object's content
    pub balance: u64,
}

/// Chain-level state the fee price is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    /// Current epoch
    pub epoch: u64,

    /// Reference fee price for the epoch
    pub reference_gas_price: u64,

    /// Epoch start, Unix milliseconds
    pub epoch_start_ms: u64,

    /// Epoch duration, milliseconds
    pub epoch_duration_ms: u64,
}

/// Response to a transaction submission
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    /// Digest of the executed transaction
    pub digest: String,

    /// Execution effects, when requested
    pub effects: Option<TransactionEffects>,
}

/// Read/write access to the chain
///
/// Implementations are expected to be thread-safe and to carry their own
/// network timeouts.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// List coins owned by `owner`, one page at a time
    async fn list_coins(&self, owner: &ChainAddress, cursor: Option<String>) -> Result<CoinPage>;

    /// Fetch the current state of several objects in one call
    ///
    /// The result is aligned with `ids`; a deleted or unknown object yields
    /// `None` at its position.
    async fn batch_get_objects(&self, ids: &[ObjectId]) -> Result<Vec<Option<ObjectSnapshot>>>;

    /// Fetch the chain's current system state
    async fn current_system_state(&self) -> Result<SystemState>;

    /// Submit a signed transaction and wait for its effects
    async fn submit_transaction(
        &self,
        transaction_bytes: &[u8],
        signatures: Vec<String>,
    ) -> Result<SubmitResponse>;
}

/// The sponsor's signing key
#[async_trait]
pub trait SponsorSigner: Send + Sync {
    /// Address of the sponsor
    fn address(&self) -> ChainAddress;

    /// Sign serialized transaction bytes
    ///
    /// May suspend; the key can live behind a hardware or remote boundary.
    async fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Parse/serialize/build access to the chain's transaction format
#[async_trait]
pub trait TxCodec: Send + Sync {
    /// Parse a transaction body (operations without gas data)
    fn parse_kind(&self, bytes: &[u8]) -> Result<TransactionData>;

    /// Parse a full wire-format transaction
    fn parse_full(&self, bytes: &[u8]) -> Result<TransactionData>;

    /// Serialize a transaction to wire format
    ///
    /// Performs the chain's dry-run, which may lower the gas budget below
    /// the ceiling set on `transaction`.
    async fn build(&self, transaction: &TransactionData, rpc: &dyn RpcClient) -> Result<Vec<u8>>;
}
