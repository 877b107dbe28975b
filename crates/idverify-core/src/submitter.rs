//! Dispatch of state-changing ledger calls and settlement tracking.

use crate::error::IdentityError;
use crate::fingerprint::IdentityFingerprint;
use crate::ledger::{LedgerContract, Receipt};
use crate::operation::{Operation, OperationKind, OperationState};
use crate::session::LedgerSession;
use crate::types::{Address, Role};
use crate::view::StatusView;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Caller-side view of a dispatched operation.
///
/// Dropping the handle only stops waiting; the dispatched call keeps running and its ledger
/// event is still reconciled when it arrives.
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    kind: OperationKind,
    fingerprint: IdentityFingerprint,
    state: watch::Receiver<OperationState>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn fingerprint(&self) -> IdentityFingerprint {
        self.fingerprint
    }

    pub fn state(&self) -> OperationState {
        self.state.borrow().clone()
    }

    /// Wait for the next state change and return the new state.
    ///
    /// Fails once the operation has published its last state and nothing newer can arrive.
    pub async fn changed(&mut self) -> Result<OperationState, IdentityError> {
        self.state.changed().await.map_err(|_| {
            IdentityError::InvariantViolation(format!(
                "operation {} stopped publishing state",
                self.id
            ))
        })?;
        Ok(self.state())
    }

    /// Suspend until the operation settles.
    pub async fn wait(mut self) -> Result<Receipt, IdentityError> {
        let settled = self
            .state
            .wait_for(OperationState::is_terminal)
            .await
            .map(|state| state.clone())
            .map_err(|_| {
                IdentityError::InvariantViolation(format!(
                    "operation {} ended without a terminal state",
                    self.id
                ))
            })?;
        match settled {
            OperationState::Confirmed(receipt) => Ok(receipt),
            OperationState::Failed(reason) => Err(reason),
            other => Err(IdentityError::InvariantViolation(format!(
                "operation {} settled in non-terminal state '{}'",
                self.id,
                other.name()
            ))),
        }
    }
}

/// Publishes validated transitions of one operation.
struct OperationTracker {
    operation: Operation,
    publisher: watch::Sender<OperationState>,
}

impl OperationTracker {
    fn advance(&mut self, next: OperationState) {
        if let Err(e) = self.operation.advance(next) {
            error!(operation_id = %self.operation.id, error = %e, "Rejected operation transition");
            return;
        }
        self.publisher.send_replace(self.operation.state().clone());
    }

    fn fail(&mut self, reason: IdentityError) {
        warn!(
            operation_id = %self.operation.id,
            kind = self.operation.kind.name(),
            fingerprint = %self.operation.fingerprint,
            error = %reason,
            "Operation failed"
        );
        self.advance(OperationState::Failed(reason));
    }
}

/// Submits register/verify calls and tracks them to settlement.
pub struct OperationSubmitter {
    session: Arc<LedgerSession>,
    ledger: Arc<dyn LedgerContract>,
    view: Arc<StatusView>,
}

impl OperationSubmitter {
    pub fn new(
        session: Arc<LedgerSession>,
        ledger: Arc<dyn LedgerContract>,
        view: Arc<StatusView>,
    ) -> Self {
        Self {
            session,
            ledger,
            view,
        }
    }

    /// Validate preconditions and dispatch. Returns at once in `Submitted` (or already
    /// `Failed` when a precondition does not hold).
    pub fn submit(&self, kind: OperationKind, fingerprint: IdentityFingerprint) -> OperationHandle {
        let mut operation = Operation::new(kind, fingerprint);
        let (publisher, state) = watch::channel(OperationState::Submitted);
        let handle = OperationHandle {
            id: operation.id,
            kind,
            fingerprint,
            state,
        };

        let from = match self.check_preconditions(kind, &fingerprint) {
            Ok(from) => from,
            Err(reason) => {
                warn!(
                    operation_id = %operation.id,
                    kind = kind.name(),
                    fingerprint = %fingerprint,
                    error = %reason,
                    "Operation rejected before dispatch"
                );
                if operation.advance(OperationState::Failed(reason)).is_ok() {
                    publisher.send_replace(operation.state().clone());
                }
                return handle;
            }
        };

        info!(
            operation_id = %operation.id,
            kind = kind.name(),
            fingerprint = %fingerprint,
            from = %from,
            "Submitting operation"
        );

        let ledger = Arc::clone(&self.ledger);
        let tracker = OperationTracker {
            operation,
            publisher,
        };
        tokio::spawn(dispatch(ledger, from, tracker));
        handle
    }

    pub fn register(&self, fingerprint: IdentityFingerprint) -> OperationHandle {
        self.submit(OperationKind::Register, fingerprint)
    }

    pub fn verify(&self, fingerprint: IdentityFingerprint) -> OperationHandle {
        self.submit(OperationKind::Verify, fingerprint)
    }

    fn check_preconditions(
        &self,
        kind: OperationKind,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Address, IdentityError> {
        let session = self.session.session();
        let account = match (&session.account, session.is_connected()) {
            (Some(account), true) => account.clone(),
            _ => {
                return Err(IdentityError::PreconditionFailed(
                    "no connected wallet account".to_string(),
                ))
            }
        };

        match kind {
            OperationKind::Register => {
                if self.view.record(fingerprint).registered {
                    return Err(IdentityError::PreconditionFailed(format!(
                        "{} is already registered",
                        fingerprint.short()
                    )));
                }
            }
            OperationKind::Verify => {
                let role = session.role();
                if role != Role::Verifier {
                    return Err(IdentityError::PreconditionFailed(format!(
                        "account {} has role '{}', verifier required",
                        account.short(),
                        role.name()
                    )));
                }
            }
        }
        Ok(account)
    }
}

async fn dispatch(ledger: Arc<dyn LedgerContract>, from: Address, mut tracker: OperationTracker) {
    let fingerprint = tracker.operation.fingerprint;
    let sent = match tracker.operation.kind {
        OperationKind::Register => ledger.register_identity(&from, &fingerprint).await,
        OperationKind::Verify => ledger.verify_identity(&from, &fingerprint).await,
    };
    let pending = match sent {
        Ok(pending) => pending,
        Err(e) => {
            tracker.fail(e.into());
            return;
        }
    };

    let tx_hash = pending.tx_hash();
    info!(operation_id = %tracker.operation.id, tx_hash = %tx_hash, "Awaiting confirmation");
    tracker.advance(OperationState::AwaitingConfirmation(tx_hash));

    match pending.await_confirmation().await {
        Ok(receipt) if receipt.success => {
            info!(
                operation_id = %tracker.operation.id,
                block = receipt.block_number,
                "Operation confirmed"
            );
            tracker.advance(OperationState::Confirmed(receipt));
        }
        Ok(_) => tracker.fail(IdentityError::reverted(None)),
        Err(e) => tracker.fail(e.into()),
    }
}
