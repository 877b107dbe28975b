use crate::error::IdentityError;
use crate::types::Address;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("user rejected the request")]
    Rejected,

    #[error("wallet transport error: {0}")]
    Transport(String),
}

impl From<WalletError> for IdentityError {
    fn from(value: WalletError) -> Self {
        match value {
            WalletError::Rejected => IdentityError::UserRejected,
            WalletError::Transport(message) => IdentityError::ConnectionError(message),
        }
    }
}

/// Browser-wallet collaborator.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Prompt the user for account access.
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;

    /// Accounts already authorized, without prompting.
    async fn current_accounts(&self) -> Result<Vec<Address>, WalletError>;

    /// Account-switch notifications. Dropping the receiver unsubscribes.
    fn accounts_changed(&self) -> broadcast::Receiver<Vec<Address>>;
}
