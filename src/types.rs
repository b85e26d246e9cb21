//! Core chain types
//!
//! Addresses, object references, the transaction command sum type and the
//! post-execution effects structures shared by every component.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed width of addresses and object ids, in bytes
pub const ADDRESS_LENGTH: usize = 32;

fn decode_hex_fixed(s: &str) -> Option<[u8; ADDRESS_LENGTH]> {
    let hex = s.strip_prefix("0x")?;
    if hex.is_empty() || hex.len() > ADDRESS_LENGTH * 2 {
        return None;
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    // Short forms are left-padded to the full width
    let padded = format!("{:0>64}", hex.to_ascii_lowercase());
    let mut out = [0u8; ADDRESS_LENGTH];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&padded[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(out)
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    write!(f, "0x")?;
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// An account address in canonical form (full width, lower-case hex)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainAddress([u8; ADDRESS_LENGTH]);

impl ChainAddress {
    /// Create an address from raw bytes
    pub fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }
}

impl FromStr for ChainAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex_fixed(s)
            .map(Self)
            .ok_or_else(|| Error::PolicyViolation(format!("invalid address format: {s}")))
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Stable identity of an on-chain object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; ADDRESS_LENGTH]);

impl ObjectId {
    /// Create an object id from raw bytes
    pub fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex_fixed(s)
            .map(Self)
            .ok_or_else(|| Error::PolicyViolation(format!("invalid object id: {s}")))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(ChainAddress);
string_serde!(ObjectId);

/// Content hash of an object at a specific version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectDigest(String);

impl ObjectDigest {
    /// Create a digest from its string form
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }
}

impl fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The (id, version, digest) triple identifying an object's on-chain state
/// at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Stable object identity
    pub object_id: ObjectId,

    /// Monotonic per-object counter assigned by the chain
    #[serde(with = "u64_str")]
    pub version: u64,

    /// Content hash at that version
    pub digest: ObjectDigest,
}

impl ObjectRef {
    /// Create an object reference
    pub fn new(object_id: ObjectId, version: u64, digest: ObjectDigest) -> Self {
        Self {
            object_id,
            version,
            digest,
        }
    }
}

/// An argument to a transaction command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Argument {
    /// The implicit gas coin of the transaction
    GasCoin,
    /// Index into the input table
    Input(u16),
    /// Result of a previous command
    Result(u16),
    /// One element of a previous command's result list
    NestedResult(u16, u16),
}

/// A resolved input to the transaction body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallInput {
    /// A literal value (amount, address, ...)
    Pure(Vec<u8>),
    /// An owned or shared object
    Object(ObjectRef),
}

/// One command of a transaction body
///
/// Commands are a closed sum type; consumers match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Call an on-chain function
    MoveCall {
        /// Package the function lives in
        package: ChainAddress,
        /// Module within the package
        module: String,
        /// Function name
        function: String,
        /// Call arguments
        arguments: Vec<Argument>,
    },

    /// Split amounts off a coin
    SplitCoins {
        /// Coin being split
        coin: Argument,
        /// Amounts to split off
        amounts: Vec<Argument>,
    },

    /// Transfer objects to an address
    TransferObjects {
        /// Objects to transfer
        objects: Vec<Argument>,
        /// Recipient address
        address: Argument,
    },

    /// Merge coins into a destination coin
    MergeCoins {
        /// Coin absorbing the sources
        destination: Argument,
        /// Coins consumed by the merge
        sources: Vec<Argument>,
    },

    /// Build a vector from elements
    MakeMoveVec {
        /// Vector elements
        elements: Vec<Argument>,
    },

    /// Deploy a new package
    Publish,

    /// Upgrade an existing package
    Upgrade {
        /// Upgrade capability ticket
        ticket: Argument,
    },
}

/// A transaction body: the serialized operations without gas data attached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionKind {
    /// Input table referenced by command arguments
    pub inputs: Vec<CallInput>,

    /// Commands executed in order
    pub commands: Vec<Command>,
}

impl TransactionKind {
    /// Body that splits the implicit gas coin into `amounts` pieces and
    /// transfers them to `recipient`
    pub fn split_gas_coin(amounts: &[u64], recipient: &ChainAddress) -> Self {
        let mut inputs = Vec::new();
        let mut amount_args = Vec::with_capacity(amounts.len());
        for amount in amounts {
            amount_args.push(Argument::Input(inputs.len() as u16));
            inputs.push(CallInput::Pure(amount.to_le_bytes().to_vec()));
        }
        let recipient_arg = Argument::Input(inputs.len() as u16);
        inputs.push(CallInput::Pure(recipient.as_bytes().to_vec()));

        let pieces = (0..amounts.len())
            .map(|i| Argument::NestedResult(0, i as u16))
            .collect();

        Self {
            inputs,
            commands: vec![
                Command::SplitCoins {
                    coin: Argument::GasCoin,
                    amounts: amount_args,
                },
                Command::TransferObjects {
                    objects: pieces,
                    address: recipient_arg,
                },
            ],
        }
    }

    /// Body that merges `sources` into the implicit gas coin
    pub fn merge_into_gas(sources: Vec<ObjectRef>) -> Self {
        let mut inputs = Vec::with_capacity(sources.len());
        let mut source_args = Vec::with_capacity(sources.len());
        for source in sources {
            source_args.push(Argument::Input(inputs.len() as u16));
            inputs.push(CallInput::Object(source));
        }

        Self {
            inputs,
            commands: vec![Command::MergeCoins {
                destination: Argument::GasCoin,
                sources: source_args,
            }],
        }
    }
}

/// Gas parameters attached to a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasData {
    /// Address paying the fee
    pub owner: Option<ChainAddress>,

    /// Coins consumed to pay the fee
    pub payment: Vec<ObjectRef>,

    /// Reference fee price the transaction was built against
    pub price: Option<u64>,

    /// Maximum fee the transaction may spend
    pub budget: Option<u64>,
}

/// A full transaction: body plus sender and gas data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    /// Transaction body
    pub kind: TransactionKind,

    /// Address authorizing the operation
    pub sender: Option<ChainAddress>,

    /// Gas parameters
    pub gas: GasData,
}

impl TransactionData {
    /// Wrap a body with empty gas data
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            sender: None,
            gas: GasData::default(),
        }
    }

    /// Commands of the transaction body
    pub fn commands(&self) -> &[Command] {
        &self.kind.commands
    }

    /// Gas parameters
    pub fn gas_data(&self) -> &GasData {
        &self.gas
    }

    /// Set the sender address
    pub fn set_sender(&mut self, sender: ChainAddress) {
        self.sender = Some(sender);
    }

    /// Set the fee-paying address
    pub fn set_gas_owner(&mut self, owner: ChainAddress) {
        self.gas.owner = Some(owner);
    }

    /// Set the fee coins
    pub fn set_gas_payment(&mut self, payment: Vec<ObjectRef>) {
        self.gas.payment = payment;
    }

    /// Set the fee price
    pub fn set_gas_price(&mut self, price: u64) {
        self.gas.price = Some(price);
    }

    /// Set the fee ceiling
    pub fn set_gas_budget(&mut self, budget: u64) {
        self.gas.budget = Some(budget);
    }
}

/// Fee breakdown from a transaction's execution effects
///
/// The chain's JSON convention carries these as decimal strings; integer
/// forms are accepted too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasUsed {
    /// Execution cost
    #[serde(with = "u64_str")]
    pub computation_cost: u64,

    /// Cost of storage written
    #[serde(with = "u64_str")]
    pub storage_cost: u64,

    /// Rebate for storage released
    #[serde(with = "u64_str")]
    pub storage_rebate: u64,

    /// Non-refundable share of the storage fee
    #[serde(default, with = "u64_str")]
    pub non_refundable_storage_fee: u64,
}

impl GasUsed {
    /// Net fee consumed by the execution
    ///
    /// May be negative: a transaction that deletes objects can net-refund.
    pub fn net_usage(&self) -> i128 {
        self.computation_cost as i128 + self.storage_cost as i128
            + self.non_refundable_storage_fee as i128
            - self.storage_rebate as i128
    }
}

/// Post-execution state of the fee coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasObject {
    /// The fee coin's new on-chain reference
    pub reference: ObjectRef,
}

/// An object created by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedObject {
    /// The new object's reference
    pub reference: ObjectRef,
}

/// The chain's post-execution report for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEffects {
    /// Post-execution state of the fee coin
    pub gas_object: GasObject,

    /// Fee breakdown
    pub gas_used: GasUsed,

    /// Objects created by the transaction
    #[serde(default)]
    pub created: Vec<CreatedObject>,
}

/// Normalize a `package::module::function` target to canonical form
pub fn normalize_target(target: &str) -> Result<String> {
    let parts: Vec<&str> = target.split("::").collect();
    if parts.len() != 3 || parts[1].is_empty() || parts[2].is_empty() {
        return Err(Error::PolicyViolation(format!(
            "invalid call target: {target}"
        )));
    }
    let package: ChainAddress = parts[0].parse()?;
    Ok(format!("{}::{}::{}", package, parts[1], parts[2]))
}

/// Decimal-string numerics, accepting integer forms as well
mod u64_str {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    pub fn serialize<S: Serializer>(
        value: &u64,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
