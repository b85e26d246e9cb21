//! Error types for the gas station

use thiserror::Error;

/// Gas station error type
///
/// Every public failure carries a stable code (see [`Error::code`]) that is
/// part of the service contract.
#[derive(Error, Debug)]
pub enum Error {
    /// A public operation was called before `initialize()`
    #[error("gas station is not initialized")]
    NotInitialized,

    /// No available coin satisfies the requested budget
    #[error("no gas coin available for a budget of {required} units")]
    PoolExhausted {
        /// Minimum balance the reservation asked for
        required: u64,
    },

    /// Request rejected by the sponsorship policy
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The codec could not parse or build the transaction
    #[error("failed to build transaction: {0}")]
    BuildFailed(String),

    /// The sponsor signer failed
    #[error("signing failed: {0}")]
    SignFailed(String),

    /// `report_execution` received malformed effects
    #[error("invalid execution effects: {0}")]
    InvalidEffects(String),

    /// initialize/replenish could not source enough coins
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Transport failure from the injected RPC client
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl Error {
    /// Stable error code for the service contract
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotInitialized => "NotInitialized",
            Error::PoolExhausted { .. } => "PoolExhausted",
            Error::PolicyViolation(_) => "PolicyViolation",
            Error::BuildFailed(_) => "BuildFailed",
            Error::SignFailed(_) => "SignFailed",
            Error::InvalidEffects(_) => "InvalidEffects",
            Error::InsufficientFunds(_) => "InsufficientFunds",
            Error::Rpc(_) => "RpcError",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
