//! Wallet session lifecycle and role resolution.

use crate::error::IdentityError;
use crate::ledger::LedgerContract;
use crate::types::{Address, ConnectionState, Role, Session, VerifierObservation};
use crate::wallet::WalletProvider;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with the new account (or `None`) after each account switch.
pub type AccountHandler = Arc<dyn Fn(Option<&Address>) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    handler: AccountHandler,
    refs: usize,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    fn register(&mut self, handler: AccountHandler) -> u64 {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.handler, &handler))
        {
            entry.refs += 1;
            return entry.id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(ListenerEntry {
            id,
            handler,
            refs: 1,
        });
        id
    }

    fn release(&mut self, id: u64) {
        if let Some(position) = self.entries.iter().position(|entry| entry.id == id) {
            let entry = &mut self.entries[position];
            entry.refs -= 1;
            if entry.refs == 0 {
                self.entries.remove(position);
            }
        }
    }

    fn handlers(&self) -> Vec<AccountHandler> {
        self.entries.iter().map(|entry| entry.handler.clone()).collect()
    }
}

/// Registration of an account-change listener. Releasing it (explicitly or by drop)
/// removes the listener exactly once.
#[must_use = "dropping the subscription removes the listener"]
pub struct AccountSubscription {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
    released: bool,
}

impl AccountSubscription {
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().release(self.id);
        }
    }
}

impl Drop for AccountSubscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Background pump applying wallet account switches to the session.
#[must_use = "dropping the watch stops following wallet account changes"]
pub struct WalletWatch {
    task: JoinHandle<()>,
}

impl WalletWatch {
    pub fn stop(self) {}

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for WalletWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the connection to the wallet and ledger collaborators.
///
/// The current [`Session`] is published on a watch channel; it is only ever modified here.
pub struct LedgerSession {
    wallet: Option<Arc<dyn WalletProvider>>,
    ledger: Arc<dyn LedgerContract>,
    state: watch::Sender<Session>,
    /// Bumped on every account adoption, disconnect and role refresh. A role read only
    /// lands if no newer one has started since.
    generation: AtomicU64,
    listeners: Arc<Mutex<ListenerRegistry>>,
}

impl LedgerSession {
    pub fn new(wallet: Option<Arc<dyn WalletProvider>>, ledger: Arc<dyn LedgerContract>) -> Self {
        let (state, _) = watch::channel(Session::disconnected());
        Self {
            wallet,
            ledger,
            state,
            generation: AtomicU64::new(0),
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
        }
    }

    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn current_account(&self) -> Option<Address> {
        self.state.borrow().account.clone()
    }

    pub fn role(&self) -> Role {
        self.state.borrow().role()
    }

    /// Prompt the wallet for account access and resolve the account's role.
    pub async fn connect(&self) -> Result<Session, IdentityError> {
        let Some(wallet) = self.wallet.clone() else {
            return Err(self.fail(IdentityError::WalletUnavailable));
        };

        self.state.send_modify(|session| {
            session.connection = ConnectionState::Connecting;
            session.last_error = None;
        });

        let accounts = match wallet.request_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => return Err(self.fail(e.into())),
        };
        let Some(account) = accounts.into_iter().next() else {
            return Err(self.fail(IdentityError::UserRejected));
        };

        info!(account = %account, "Wallet connected");
        self.adopt_account(Some(account)).await;
        Ok(self.session())
    }

    /// Adopt an already-authorized account without prompting.
    pub async fn resume(&self) -> Result<Session, IdentityError> {
        let wallet = self.wallet.clone().ok_or(IdentityError::WalletUnavailable)?;
        let accounts = wallet.current_accounts().await?;
        match accounts.into_iter().next() {
            Some(account) => {
                info!(account = %account, "Resumed wallet session");
                self.adopt_account(Some(account)).await;
            }
            None => debug!("No authorized wallet account to resume"),
        }
        Ok(self.session())
    }

    pub fn disconnect(&self) {
        self.state.send_modify(|session| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *session = Session::disconnected();
        });
        info!("Wallet session disconnected");
        self.notify(None);
    }

    /// Read the ledger's verifier address and derive `address`'s role.
    ///
    /// Read failures fail open to `Unauthenticated`. The observation is only recorded if
    /// `address` is still the session's account when the read completes and no account
    /// switch or refresh happened in between.
    pub async fn resolve_role(&self, address: &Address) -> Role {
        let generation = self.generation.load(Ordering::SeqCst);
        self.resolve_role_at(address, generation).await
    }

    async fn resolve_role_at(&self, address: &Address, generation: u64) -> Role {
        let (role, observation) = match self.ledger.verifier_address().await {
            Ok(verifier) => {
                let role = if &verifier == address {
                    Role::Verifier
                } else {
                    Role::User
                };
                (role, VerifierObservation::Observed(verifier))
            }
            Err(e) => {
                warn!(
                    account = %address,
                    error = %e,
                    "Verifier lookup failed; treating account as unauthenticated"
                );
                (Role::Unauthenticated, VerifierObservation::Unavailable)
            }
        };

        let applied = self.state.send_if_modified(|session| {
            if session.account.as_ref() != Some(address)
                || self.generation.load(Ordering::SeqCst) != generation
            {
                return false;
            }
            session.verifier = observation;
            true
        });
        if applied {
            debug!(account = %address, role = role.name(), "Resolved session role");
        } else {
            debug!(account = %address, generation, "Discarded superseded role read");
        }
        role
    }

    /// Re-run role resolution for the current account.
    pub async fn refresh_role(&self) -> Role {
        let Some(account) = self.current_account() else {
            return Role::Unauthenticated;
        };
        let mut generation = None;
        self.state.send_modify(|session| {
            if session.account.as_ref() == Some(&account) {
                generation = Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1);
                session.verifier = VerifierObservation::Pending;
            }
        });
        match generation {
            Some(generation) => self.resolve_role_at(&account, generation).await,
            None => self.resolve_role(&account).await,
        }
    }

    /// Apply an account switch reported by the wallet.
    pub async fn apply_account_change(&self, accounts: Vec<Address>) {
        let account = accounts.into_iter().next();
        match &account {
            Some(account) => info!(account = %account, "Wallet account changed"),
            None => info!("Wallet reported no accounts"),
        }
        self.adopt_account(account).await;
    }

    pub fn observe_account_change(&self, handler: AccountHandler) -> AccountSubscription {
        let id = self.listeners.lock().register(handler);
        AccountSubscription {
            id,
            registry: Arc::downgrade(&self.listeners),
            released: false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Follow the wallet's account-change stream until the returned handle is dropped.
    pub fn watch_wallet(self: &Arc<Self>) -> Result<WalletWatch, IdentityError> {
        let wallet = self.wallet.clone().ok_or(IdentityError::WalletUnavailable)?;
        let mut changes = wallet.accounts_changed();
        let session = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(accounts) => session.apply_account_change(accounts).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Account change stream lagged; re-reading accounts");
                        match wallet.current_accounts().await {
                            Ok(accounts) => session.apply_account_change(accounts).await,
                            Err(e) => warn!(error = %e, "Failed to re-read wallet accounts"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Wallet account stream closed");
                        break;
                    }
                }
            }
        });

        Ok(WalletWatch { task })
    }

    async fn adopt_account(&self, account: Option<Address>) {
        let mut generation = 0;
        self.state.send_modify(|session| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            session.last_error = None;
            match &account {
                Some(address) => {
                    session.account = Some(address.clone());
                    session.connection = ConnectionState::Connected;
                    session.verifier = VerifierObservation::Pending;
                }
                None => {
                    session.account = None;
                    session.connection = ConnectionState::Disconnected;
                    session.verifier = VerifierObservation::Unchecked;
                }
            }
        });

        if let Some(address) = &account {
            self.resolve_role_at(address, generation).await;
        }
        self.notify(account.as_ref());
    }

    fn notify(&self, account: Option<&Address>) {
        let handlers = self.listeners.lock().handlers();
        for handler in handlers {
            handler(account);
        }
    }

    fn fail(&self, error: IdentityError) -> IdentityError {
        warn!(error = %error, "Wallet connection failed");
        let message = error.to_string();
        self.state.send_modify(|session| {
            session.connection = ConnectionState::Error;
            session.last_error = Some(message);
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, FakeLedger, FakeWallet, USER, VERIFIER};
    use std::sync::atomic::AtomicUsize;

    fn session_with(wallet: Option<FakeWallet>, ledger: Arc<FakeLedger>) -> Arc<LedgerSession> {
        let wallet = wallet.map(|w| Arc::new(w) as Arc<dyn WalletProvider>);
        Arc::new(LedgerSession::new(wallet, ledger))
    }

    #[tokio::test]
    async fn connect_without_wallet_fails_unavailable() {
        let session = session_with(None, Arc::new(FakeLedger::new(VERIFIER)));
        let err = session.connect().await.unwrap_err();
        assert_eq!(err, IdentityError::WalletUnavailable);
        assert_eq!(session.session().connection, ConnectionState::Error);
        assert!(session.session().last_error.is_some());
    }

    #[tokio::test]
    async fn connect_rejected_by_user() {
        let session = session_with(
            Some(FakeWallet::rejecting()),
            Arc::new(FakeLedger::new(VERIFIER)),
        );
        assert_eq!(session.connect().await.unwrap_err(), IdentityError::UserRejected);
        assert_eq!(session.role(), Role::Unauthenticated);
    }

    #[tokio::test]
    async fn connect_with_no_accounts_counts_as_rejection() {
        let session = session_with(Some(FakeWallet::new(&[])), Arc::new(FakeLedger::new(VERIFIER)));
        assert_eq!(session.connect().await.unwrap_err(), IdentityError::UserRejected);
    }

    #[tokio::test]
    async fn connect_resolves_verifier_case_insensitively() {
        let upper = VERIFIER.to_uppercase().replacen("0X", "0x", 1);
        let session = session_with(
            Some(FakeWallet::new(&[upper.as_str()])),
            Arc::new(FakeLedger::new(VERIFIER)),
        );
        let connected = session.connect().await.unwrap();
        assert_eq!(connected.connection, ConnectionState::Connected);
        assert_eq!(connected.role(), Role::Verifier);
    }

    #[tokio::test]
    async fn connect_as_user() {
        let session = session_with(Some(FakeWallet::new(&[USER])), Arc::new(FakeLedger::new(VERIFIER)));
        let connected = session.connect().await.unwrap();
        assert_eq!(connected.role(), Role::User);
        assert_eq!(session.current_account(), Some(addr(USER)));
    }

    #[tokio::test]
    async fn role_read_failure_fails_open() {
        let ledger = Arc::new(FakeLedger::new(VERIFIER));
        ledger.set_fail_reads(true);
        let session = session_with(Some(FakeWallet::new(&[VERIFIER])), ledger.clone());
        let connected = session.connect().await.unwrap();
        assert_eq!(connected.role(), Role::Unauthenticated);
        assert_eq!(connected.verifier, VerifierObservation::Unavailable);

        ledger.set_fail_reads(false);
        assert_eq!(session.refresh_role().await, Role::Verifier);
        assert_eq!(session.role(), Role::Verifier);
    }

    #[tokio::test]
    async fn account_change_triggers_fresh_resolution() {
        let ledger = Arc::new(FakeLedger::new(VERIFIER));
        let session = session_with(Some(FakeWallet::new(&[VERIFIER])), ledger.clone());
        session.connect().await.unwrap();
        assert_eq!(session.role(), Role::Verifier);

        session.apply_account_change(vec![addr(USER)]).await;
        assert_eq!(session.role(), Role::User);

        // Verifier rotated on the ledger: the next switch must observe it.
        ledger.set_verifier(USER);
        session.apply_account_change(vec![addr(USER)]).await;
        assert_eq!(session.role(), Role::Verifier);

        session.apply_account_change(vec![]).await;
        assert_eq!(session.role(), Role::Unauthenticated);
        assert_eq!(session.session().connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stale_role_read_is_discarded() {
        let session = session_with(Some(FakeWallet::new(&[USER])), Arc::new(FakeLedger::new(VERIFIER)));
        session.connect().await.unwrap();
        // A read for an address that is no longer the account must not touch the session.
        let role = session.resolve_role(&addr(VERIFIER)).await;
        assert_eq!(role, Role::Verifier);
        assert_eq!(session.role(), Role::User);
    }

    #[tokio::test]
    async fn role_read_overtaken_by_switch_back_is_discarded() {
        let ledger = Arc::new(FakeLedger::new(VERIFIER));
        let session = session_with(Some(FakeWallet::new(&[USER])), ledger.clone());
        session.connect().await.unwrap();
        assert_eq!(session.role(), Role::User);

        // This read observes the old verifier and is held until released below.
        let gate = ledger.gate_reads();
        let slow = tokio::spawn({
            let session = session.clone();
            async move { session.refresh_role().await }
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        ledger.open_reads();
        ledger.set_verifier(USER);
        session.apply_account_change(vec![addr(VERIFIER)]).await;
        session.apply_account_change(vec![addr(USER)]).await;
        assert_eq!(session.role(), Role::Verifier);

        gate.notify_one();
        assert_eq!(slow.await.unwrap(), Role::User);
        assert_eq!(session.role(), Role::Verifier);
        assert_eq!(
            session.session().verifier,
            VerifierObservation::Observed(addr(USER))
        );
    }

    #[tokio::test]
    async fn resume_adopts_authorized_account_without_prompt() {
        let session = session_with(
            Some(FakeWallet::new(&[VERIFIER])),
            Arc::new(FakeLedger::new(VERIFIER)),
        );
        let resumed = session.resume().await.unwrap();
        assert_eq!(resumed.role(), Role::Verifier);

        let empty = session_with(Some(FakeWallet::new(&[])), Arc::new(FakeLedger::new(VERIFIER)));
        let resumed = empty.resume().await.unwrap();
        assert_eq!(resumed.connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn duplicate_listener_registration_is_shared_and_removable() {
        let session = session_with(Some(FakeWallet::new(&[USER])), Arc::new(FakeLedger::new(VERIFIER)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: AccountHandler = Arc::new(move |_: Option<&Address>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = session.observe_account_change(handler.clone());
        let second = session.observe_account_change(handler);
        assert_eq!(session.listener_count(), 1);

        session.connect().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        first.release();
        assert_eq!(session.listener_count(), 1);
        drop(second);
        assert_eq!(session.listener_count(), 0);

        session.apply_account_change(vec![addr(VERIFIER)]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wallet_watch_follows_switches_until_dropped() {
        let wallet = Arc::new(FakeWallet::new(&[USER]));
        let ledger = Arc::new(FakeLedger::new(VERIFIER));
        let session = Arc::new(LedgerSession::new(
            Some(wallet.clone() as Arc<dyn WalletProvider>),
            ledger,
        ));
        session.connect().await.unwrap();
        let mut updates = session.subscribe();

        let watch = session.watch_wallet().unwrap();
        assert!(watch.is_running());
        wallet.switch_to(&[VERIFIER]);
        updates
            .wait_for(|s| s.role() == Role::Verifier)
            .await
            .unwrap();

        watch.stop();
        tokio::task::yield_now().await;
        wallet.switch_to(&[USER]);
        tokio::task::yield_now().await;
        assert_eq!(session.role(), Role::Verifier);
    }

    #[tokio::test]
    async fn disconnect_resets_session_and_notifies() {
        let session = session_with(Some(FakeWallet::new(&[USER])), Arc::new(FakeLedger::new(VERIFIER)));
        session.connect().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = session.observe_account_change(Arc::new(move |account: Option<&Address>| {
            sink.lock().push(account.cloned());
        }));
        session.disconnect();
        assert_eq!(session.session(), Session::disconnected());
        assert_eq!(seen.lock().as_slice(), &[None]);
    }
}
