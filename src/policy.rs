//! Sponsorship policy
//!
//! Pure validation of a (sender, transaction body, requested budget) tuple
//! against operator-configured constraints, plus the always-on check that
//! keeps sender commands away from the sponsor's fee coin.

use crate::types::{normalize_target, Argument, ChainAddress, Command, TransactionKind};
use crate::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Operator-supplied validation hook, invoked after the built-in checks.
/// Returning `false` rejects the request.
pub type CustomValidator = Arc<dyn Fn(&ChainAddress, &TransactionKind, u64) -> bool + Send + Sync>;

/// Sponsor-side constraints on what gets sponsored
#[derive(Clone, Default)]
pub struct Policy {
    max_budget_per_tx: Option<u64>,
    allowed_targets: HashSet<String>,
    blocked_senders: HashSet<ChainAddress>,
    allow_gas_coin_usage: bool,
    custom_validator: Option<CustomValidator>,
}

impl Policy {
    /// Policy with no constraints
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the gas budget a single transaction may request
    pub fn with_max_budget_per_tx(mut self, max_budget: u64) -> Self {
        self.max_budget_per_tx = Some(max_budget);
        self
    }

    /// Restrict sponsorship to the given `package::module::function` targets
    ///
    /// Targets are normalized to canonical addresses; an entry that cannot
    /// be normalized is kept verbatim and will never match.
    pub fn with_allowed_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for target in targets {
            let raw = target.as_ref();
            match normalize_target(raw) {
                Ok(normalized) => {
                    self.allowed_targets.insert(normalized);
                }
                Err(_) => {
                    warn!("allowlist target {raw} does not normalize; it will never match");
                    self.allowed_targets.insert(raw.to_string());
                }
            }
        }
        self
    }

    /// Refuse sponsorship for the given sender addresses
    pub fn with_blocked_senders<I>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = ChainAddress>,
    {
        self.blocked_senders.extend(senders);
        self
    }

    /// Permit commands that reference the fee coin
    ///
    /// Off by default: a sender command touching the fee coin can extract
    /// value from the sponsor beyond the gas fee.
    pub fn with_allow_gas_coin_usage(mut self, allow: bool) -> Self {
        self.allow_gas_coin_usage = allow;
        self
    }

    /// Add a custom validation hook, invoked after the built-in checks
    pub fn with_custom_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&ChainAddress, &TransactionKind, u64) -> bool + Send + Sync + 'static,
    {
        self.custom_validator = Some(Arc::new(validator));
        self
    }

    /// Configured budget cap, if any
    pub fn max_budget_per_tx(&self) -> Option<u64> {
        self.max_budget_per_tx
    }

    /// Whether commands may reference the fee coin
    pub fn allows_gas_coin_usage(&self) -> bool {
        self.allow_gas_coin_usage
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("max_budget_per_tx", &self.max_budget_per_tx)
            .field("allowed_targets", &self.allowed_targets)
            .field("blocked_senders", &self.blocked_senders)
            .field("allow_gas_coin_usage", &self.allow_gas_coin_usage)
            .field("custom_validator", &self.custom_validator.is_some())
            .finish()
    }
}

/// Validate a sponsorship request against a policy
///
/// Checks run cheapest first: budget cap, sender blocklist, target
/// allowlist, custom validator. The first failing check rejects.
pub fn validate(
    policy: &Policy,
    sender: &ChainAddress,
    kind: &TransactionKind,
    requested_budget: u64,
) -> Result<()> {
    if let Some(cap) = policy.max_budget_per_tx {
        if requested_budget > cap {
            return Err(Error::PolicyViolation(format!(
                "requested budget {requested_budget} exceeds the per-transaction cap {cap}"
            )));
        }
    }

    if policy.blocked_senders.contains(sender) {
        return Err(Error::PolicyViolation(format!("sender {sender} is blocked")));
    }

    if !policy.allowed_targets.is_empty() {
        for command in &kind.commands {
            match command {
                // deploys have no per-function target and would bypass the
                // allowlist entirely
                Command::Publish | Command::Upgrade { .. } => {
                    return Err(Error::PolicyViolation(
                        "package publish and upgrade are not sponsored under a target allowlist"
                            .into(),
                    ));
                }
                Command::MoveCall {
                    package,
                    module,
                    function,
                    ..
                } => {
                    let target = format!("{package}::{module}::{function}");
                    if !policy.allowed_targets.contains(&target) {
                        return Err(Error::PolicyViolation(format!(
                            "call target {target} is not in the allowlist"
                        )));
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(validator) = &policy.custom_validator {
        if !validator(sender, kind, requested_budget) {
            return Err(Error::PolicyViolation(
                "request rejected by custom validator".into(),
            ));
        }
    }

    debug!("sponsorship request for {sender} passed policy");
    Ok(())
}

/// Reject any command that references the transaction's fee coin
///
/// A command like `SplitCoins(GasCoin, [amount])` followed by a transfer
/// lets the sender extract value from the sponsor's coin beyond the fee.
pub fn ensure_gas_coin_untouched(commands: &[Command]) -> Result<()> {
    for command in commands {
        let touches_gas = command_arguments(command)
            .into_iter()
            .any(|argument| matches!(argument, Argument::GasCoin));
        if touches_gas {
            return Err(Error::PolicyViolation(format!(
                "{} command references the GasCoin; the fee coin belongs to the sponsor",
                command_name(command)
            )));
        }
    }
    Ok(())
}

fn command_arguments(command: &Command) -> Vec<&Argument> {
    match command {
        Command::MoveCall { arguments, .. } => arguments.iter().collect(),
        Command::SplitCoins { coin, amounts } => {
            std::iter::once(coin).chain(amounts.iter()).collect()
        }
        Command::TransferObjects { objects, address } => {
            objects.iter().chain(std::iter::once(address)).collect()
        }
        Command::MergeCoins {
            destination,
            sources,
        } => std::iter::once(destination).chain(sources.iter()).collect(),
        Command::MakeMoveVec { elements } => elements.iter().collect(),
        Command::Upgrade { ticket } => vec![ticket],
        Command::Publish => Vec::new(),
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::MoveCall { .. } => "MoveCall",
        Command::SplitCoins { .. } => "SplitCoins",
        Command::TransferObjects { .. } => "TransferObjects",
        Command::MergeCoins { .. } => "MergeCoins",
        Command::MakeMoveVec { .. } => "MakeMoveVec",
        Command::Publish => "Publish",
        Command::Upgrade { .. } => "Upgrade",
    }
}
