use crate::fingerprint::IdentityFingerprint;
use thiserror::Error;

/// Identity verification client errors.
///
/// Every variant is recoverable at session or operation granularity; nothing here is fatal
/// to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("No wallet provider is available")]
    WalletUnavailable,

    #[error("User rejected the wallet request")]
    UserRejected,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Identity already registered")]
    AlreadyRegistered,

    #[error("Identity already verified")]
    AlreadyVerified,

    #[error("Execution reverted: {0}")]
    ExecutionReverted(String),

    #[error("Transaction was dropped before inclusion")]
    TransactionDropped,

    #[error("Ledger read failed: {0}")]
    ReadError(String),

    #[error("Verified event observed for unregistered fingerprint {0}")]
    InconsistentEvent(IdentityFingerprint),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IdentityError {
    /// Generic revert reason used when the ledger supplies none.
    pub const GENERIC_REVERT: &'static str = "execution reverted";

    pub fn transition_violation(from: &str, to: &str) -> Self {
        Self::InvariantViolation(format!(
            "operation state violation: cannot move from '{}' to '{}'",
            from, to
        ))
    }

    pub fn reverted(reason: Option<String>) -> Self {
        Self::ExecutionReverted(reason.unwrap_or_else(|| Self::GENERIC_REVERT.to_string()))
    }
}
