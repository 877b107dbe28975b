//! Consumed surface of the identity ledger contract.

use crate::error::IdentityError;
use crate::fingerprint::IdentityFingerprint;
use crate::types::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

/// Transaction hash reported by the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    Registered,
    Verified,
}

/// Contract event as emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub fingerprint: IdentityFingerprint,
    pub block_number: u64,
    pub tx_hash: TxHash,
    pub log_index: u32,
}

/// Inclusion receipt for a settled transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub events: Vec<LedgerEvent>,
}

/// Revert reasons normalized from contract messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    AlreadyRegistered,
    AlreadyVerified,
    Message(String),
    Unknown,
}

impl RevertReason {
    /// Map a raw revert message onto the known contract reasons.
    pub fn classify(message: Option<&str>) -> Self {
        let Some(message) = message.map(str::trim).filter(|m| !m.is_empty()) else {
            return Self::Unknown;
        };
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("already registered") {
            Self::AlreadyRegistered
        } else if lowered.contains("already verified") {
            Self::AlreadyVerified
        } else {
            Self::Message(message.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("request rejected by signer")]
    Rejected,

    #[error("transaction reverted: {0:?}")]
    Reverted(RevertReason),

    #[error("transaction dropped")]
    Dropped,

    #[error("ledger transport error: {0}")]
    Transport(String),
}

impl From<LedgerError> for IdentityError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Rejected => IdentityError::UserRejected,
            LedgerError::Reverted(RevertReason::AlreadyRegistered) => {
                IdentityError::AlreadyRegistered
            }
            LedgerError::Reverted(RevertReason::AlreadyVerified) => IdentityError::AlreadyVerified,
            LedgerError::Reverted(RevertReason::Message(message)) => {
                IdentityError::reverted(Some(message))
            }
            LedgerError::Reverted(RevertReason::Unknown) => IdentityError::reverted(None),
            LedgerError::Dropped => IdentityError::TransactionDropped,
            LedgerError::Transport(message) => IdentityError::ConnectionError(message),
        }
    }
}

/// A dispatched transaction awaiting inclusion.
#[async_trait]
pub trait PendingTransaction: Send {
    fn tx_hash(&self) -> TxHash;

    /// Suspends until the ledger includes or drops the transaction. No timeout is applied.
    async fn await_confirmation(self: Box<Self>) -> Result<Receipt, LedgerError>;
}

/// Identity ledger contract collaborator.
///
/// Implementations normalize any non-boolean wire encoding of the registration flags
/// before returning.
#[async_trait]
pub trait LedgerContract: Send + Sync {
    async fn verifier_address(&self) -> Result<Address, LedgerError>;

    async fn is_registered(&self, fingerprint: &IdentityFingerprint) -> Result<bool, LedgerError>;

    async fn is_verified(&self, fingerprint: &IdentityFingerprint) -> Result<bool, LedgerError>;

    async fn register_identity(
        &self,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Box<dyn PendingTransaction>, LedgerError>;

    async fn verify_identity(
        &self,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Box<dyn PendingTransaction>, LedgerError>;

    /// Historical events, optionally filtered to one kind.
    async fn query_events(
        &self,
        kind: Option<LedgerEventKind>,
    ) -> Result<Vec<LedgerEvent>, LedgerError>;

    /// Live events of one kind. Dropping the receiver detaches the listener.
    fn subscribe(&self, kind: LedgerEventKind) -> broadcast::Receiver<LedgerEvent>;
}
