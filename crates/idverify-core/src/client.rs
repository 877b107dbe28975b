use crate::config::ClientConfig;
use crate::error::IdentityError;
use crate::fingerprint::{derive_fingerprint, IdentityFingerprint};
use crate::gate::{Access, AccessGate, RouteGuard};
use crate::ledger::LedgerContract;
use crate::reconciler::{EventReconciler, Subscription, UpdateHandler};
use crate::session::{LedgerSession, WalletWatch};
use crate::submitter::{OperationHandle, OperationSubmitter};
use crate::types::{Role, Session};
use crate::view::{IdentityRecord, PendingSet, StatusView};
use crate::wallet::WalletProvider;
use std::sync::Arc;
use tracing::info;

/// Identity verification client wiring session, submission, reconciliation, and access
/// checks over one shared status view.
pub struct IdentityClient {
    config: ClientConfig,
    session: Arc<LedgerSession>,
    submitter: OperationSubmitter,
    reconciler: EventReconciler,
    gate: AccessGate,
    view: Arc<StatusView>,
}

impl IdentityClient {
    pub fn new(
        wallet: Option<Arc<dyn WalletProvider>>,
        ledger: Arc<dyn LedgerContract>,
        config: ClientConfig,
    ) -> Self {
        let view = Arc::new(StatusView::new());
        let session = Arc::new(LedgerSession::new(wallet, Arc::clone(&ledger)));
        let submitter =
            OperationSubmitter::new(Arc::clone(&session), Arc::clone(&ledger), Arc::clone(&view));
        let reconciler = EventReconciler::new(ledger, Arc::clone(&view));

        info!(
            contract = %config.contract_address,
            "Identity client initialized"
        );

        Self {
            config,
            session,
            submitter,
            reconciler,
            gate: AccessGate,
            view,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<LedgerSession> {
        &self.session
    }

    pub fn reconciler(&self) -> &EventReconciler {
        &self.reconciler
    }

    pub fn view(&self) -> &Arc<StatusView> {
        &self.view
    }

    pub async fn connect(&self) -> Result<Session, IdentityError> {
        self.session.connect().await
    }

    pub async fn resume(&self) -> Result<Session, IdentityError> {
        self.session.resume().await
    }

    pub fn watch_wallet(&self) -> Result<WalletWatch, IdentityError> {
        self.session.watch_wallet()
    }

    pub fn fingerprint(
        &self,
        name: &str,
        document_hash: &str,
    ) -> Result<IdentityFingerprint, IdentityError> {
        derive_fingerprint(name, document_hash)
    }

    /// Derive the fingerprint for `name` and `document_hash` and submit its registration.
    pub fn register(
        &self,
        name: &str,
        document_hash: &str,
    ) -> Result<OperationHandle, IdentityError> {
        let fingerprint = self.fingerprint(name, document_hash)?;
        Ok(self.submitter.register(fingerprint))
    }

    pub fn verify(&self, fingerprint: IdentityFingerprint) -> OperationHandle {
        self.submitter.verify(fingerprint)
    }

    /// Locally reconciled status; unknown fingerprints read as unregistered.
    pub fn status(&self, fingerprint: &IdentityFingerprint) -> IdentityRecord {
        self.view.record(fingerprint)
    }

    /// Authoritative status read from the ledger, merged into the local view.
    pub async fn check_status(
        &self,
        fingerprint: &IdentityFingerprint,
    ) -> Result<IdentityRecord, IdentityError> {
        self.reconciler.refresh(fingerprint).await
    }

    pub fn pending(&self) -> PendingSet {
        self.view.pending()
    }

    pub fn authorize(&self, required: Role) -> Access {
        self.gate.authorize(Some(&self.session.session()), required)
    }

    pub fn route_guard(&self, required: Role) -> RouteGuard {
        RouteGuard::new(required, self.config.routes.clone())
    }

    /// Attach live listeners, then replay history into the view.
    ///
    /// Listeners go first so nothing emitted during the replay is missed; the overlap is
    /// absorbed by the idempotent merge.
    pub async fn start_sync(&self, on_update: UpdateHandler) -> Subscription {
        let subscription = self.reconciler.subscribe(on_update);
        let records = self.reconciler.load_history().await;
        info!(
            identities = records.len(),
            pending = self.view.pending().len(),
            "Status view synchronized"
        );
        subscription
    }
}
