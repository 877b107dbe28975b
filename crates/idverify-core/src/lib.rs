//! Session and ledger-state synchronization core for identity verification.
//!
//! Derives privacy-preserving identity fingerprints, keeps an authenticated wallet session
//! with its authorization role, tracks register/verify submissions to settlement, and folds
//! historical and live ledger events into a monotone "pending vs. verified" status view.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod ledger;
pub mod operation;
pub mod reconciler;
pub mod session;
pub mod submitter;
pub mod types;
pub mod view;
pub mod wallet;

#[cfg(test)]
mod testing;

pub use client::IdentityClient;
pub use config::{ClientConfig, LoggingConfig, RouteConfig};
pub use error::IdentityError;
pub use fingerprint::{derive_fingerprint, FingerprintDeriver, IdentityFingerprint, NonEmptyString};
pub use gate::{Access, AccessGate, DenyReason, GuardState, RouteGuard};
pub use ledger::{
    LedgerContract, LedgerError, LedgerEvent, LedgerEventKind, PendingTransaction, Receipt,
    RevertReason, TxHash,
};
pub use operation::{Operation, OperationKind, OperationState};
pub use reconciler::{EventReconciler, ReconcileUpdate, Subscription, UpdateHandler};
pub use session::{AccountHandler, AccountSubscription, LedgerSession, WalletWatch};
pub use submitter::{OperationHandle, OperationSubmitter};
pub use types::{Address, ConnectionState, Role, Session, VerifierObservation};
pub use view::{IdentityRecord, IdentityStatus, PendingSet, StatusView};
pub use wallet::{WalletError, WalletProvider};
