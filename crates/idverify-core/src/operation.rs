use crate::error::IdentityError;
use crate::fingerprint::IdentityFingerprint;
use crate::ledger::{Receipt, TxHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Register,
    Verify,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Verify => "verify",
        }
    }
}

/// Lifecycle of a submitted ledger operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Submitted,
    AwaitingConfirmation(TxHash),
    Confirmed(Receipt),
    Failed(IdentityError),
}

impl OperationState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::AwaitingConfirmation(_) => "awaiting_confirmation",
            Self::Confirmed(_) => "confirmed",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed(_) | Self::Failed(_))
    }

    fn permits(&self, next: &OperationState) -> bool {
        matches!(
            (self, next),
            (Self::Submitted, Self::AwaitingConfirmation(_))
                | (Self::Submitted, Self::Failed(_))
                | (Self::AwaitingConfirmation(_), Self::Confirmed(_))
                | (Self::AwaitingConfirmation(_), Self::Failed(_))
        )
    }
}

/// A dispatched operation and its one-directional state machine.
///
/// No state is ever re-entered; terminal states accept no further transitions.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub fingerprint: IdentityFingerprint,
    pub submitted_at: DateTime<Utc>,
    state: OperationState,
}

impl Operation {
    pub fn new(kind: OperationKind, fingerprint: IdentityFingerprint) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            fingerprint,
            submitted_at: Utc::now(),
            state: OperationState::Submitted,
        }
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    pub fn advance(&mut self, next: OperationState) -> Result<(), IdentityError> {
        if !self.state.permits(&next) {
            return Err(IdentityError::transition_violation(
                self.state.name(),
                next.name(),
            ));
        }
        self.state = next;
        Ok(())
    }
}
