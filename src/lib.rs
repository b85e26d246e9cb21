//! # Gas Station
//!
//! Core of a gas-sponsorship service for a chain whose transactions carry a
//! two-party payer model: a sender authorizes an operation, a sponsor
//! authorizes paying its execution fee.
//!
//! This crate provides:
//! - A pool of pre-sized fee coins with at-most-one-use reservations
//! - A reservation lifecycle with bounded in-flight time
//! - An epoch-aware cache for the network's reference fee price
//! - Sponsor-side policy enforcement, including the gas-coin drain check
//! - The sponsorship orchestration over injected RPC, signer and codec

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
mod interfaces;
mod policy;
mod pool;
mod price;
mod station;
mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use interfaces::{
    CoinInfo, CoinPage, ObjectSnapshot, RpcClient, SponsorSigner, SubmitResponse, SystemState,
    TxCodec,
};
pub use policy::{CustomValidator, Policy};
pub use pool::{CoinEntry, CoinPool, CoinStatus, PoolConfig, PoolStats, Reservation};
pub use price::{PriceCache, DEFAULT_EPOCH_BOUNDARY_WINDOW_MS, MAX_BOUNDARY_WAIT_MS};
pub use station::{
    DepletionCallback, GasStation, GasStationConfig, SponsorRequest, SponsoredTransaction,
};
pub use types::{
    normalize_target, Argument, CallInput, ChainAddress, Command, CreatedObject, GasData,
    GasObject, GasUsed, ObjectDigest, ObjectId, ObjectRef, TransactionData, TransactionEffects,
    TransactionKind, ADDRESS_LENGTH,
};
