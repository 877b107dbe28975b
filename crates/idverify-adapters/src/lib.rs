//! In-memory collaborators for idverify.
//!
//! `InMemoryLedger` simulates the identity registry contract with explicit control over
//! mining, event delivery, and read failures. `InMemoryWallet` stands in for a browser wallet.

#![deny(unsafe_code)]

use async_trait::async_trait;
use idverify_core::config::ClientConfig;
use idverify_core::fingerprint::IdentityFingerprint;
use idverify_core::ledger::{
    LedgerContract, LedgerError, LedgerEvent, LedgerEventKind, PendingTransaction, Receipt,
    RevertReason, TxHash,
};
use idverify_core::types::Address;
use idverify_core::wallet::{WalletError, WalletProvider};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

/// Contract storage encodes registration as a numeric flag; `1` means registered.
const REGISTERED_FLAG: u8 = 1;

struct QueuedTransaction {
    kind: LedgerEventKind,
    from: Address,
    fingerprint: IdentityFingerprint,
    tx_hash: TxHash,
    reply: oneshot::Sender<Result<Receipt, LedgerError>>,
}

struct LedgerState {
    verifier: Address,
    registrations: BTreeMap<IdentityFingerprint, u8>,
    verified: BTreeSet<IdentityFingerprint>,
    events: Vec<LedgerEvent>,
    block_number: u64,
    nonce: u64,
    auto_mine: bool,
    duplicate_delivery: bool,
    fail_reads: bool,
    reject_next: bool,
    mempool: Vec<QueuedTransaction>,
}

/// Deterministic identity registry simulator.
///
/// Auto-mining (the default) includes every transaction in its own block on submission.
/// With auto-mining off, transactions wait in a mempool until [`InMemoryLedger::mine`]
/// includes them together or [`InMemoryLedger::drop_pending`] discards them.
pub struct InMemoryLedger {
    contract_address: Address,
    state: Mutex<LedgerState>,
    registered_tx: broadcast::Sender<LedgerEvent>,
    verified_tx: broadcast::Sender<LedgerEvent>,
}

impl InMemoryLedger {
    pub fn new(contract_address: Address, verifier: Address, event_capacity: usize) -> Self {
        let (registered_tx, _) = broadcast::channel(event_capacity.max(1));
        let (verified_tx, _) = broadcast::channel(event_capacity.max(1));
        Self {
            contract_address,
            state: Mutex::new(LedgerState {
                verifier,
                registrations: BTreeMap::new(),
                verified: BTreeSet::new(),
                events: Vec::new(),
                block_number: 0,
                nonce: 0,
                auto_mine: true,
                duplicate_delivery: false,
                fail_reads: false,
                reject_next: false,
                mempool: Vec::new(),
            }),
            registered_tx,
            verified_tx,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.contract_address.clone(),
            config.verifier_address.clone(),
            config.event_channel_capacity,
        )
    }

    pub fn contract_address(&self) -> &Address {
        &self.contract_address
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().block_number
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        self.state.lock().auto_mine = enabled;
    }

    /// Deliver every live event twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().duplicate_delivery = enabled;
    }

    pub fn set_fail_reads(&self, enabled: bool) {
        self.state.lock().fail_reads = enabled;
    }

    /// The next submitted transaction is refused by the signer.
    pub fn reject_next_submission(&self) {
        self.state.lock().reject_next = true;
    }

    /// Replace the verifier, as a contract owner would.
    pub fn rotate_verifier(&self, verifier: Address) {
        info!(verifier = %verifier, "Verifier rotated");
        self.state.lock().verifier = verifier;
    }

    pub fn pending_transactions(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.state.lock().events.clone()
    }

    /// Include every queued transaction in one new block. Returns how many were included.
    pub fn mine(&self) -> usize {
        let (results, emitted, block) = {
            let mut state = self.state.lock();
            let queued = std::mem::take(&mut state.mempool);
            if queued.is_empty() {
                return 0;
            }
            state.block_number += 1;
            let block = state.block_number;
            let mut emitted = Vec::new();
            let mut results = Vec::with_capacity(queued.len());
            for tx in queued {
                let outcome = state.execute(&tx, block, emitted.len() as u32);
                if let Ok(receipt) = &outcome {
                    emitted.extend(receipt.events.iter().cloned());
                }
                results.push((tx.reply, outcome));
            }
            (results, emitted, block)
        };

        let included = results.len();
        debug!(block, included, events = emitted.len(), "Mined block");
        self.broadcast(&emitted);
        for (reply, outcome) in results {
            let _ = reply.send(outcome);
        }
        included
    }

    /// Discard queued transactions; their confirmations resolve as dropped.
    pub fn drop_pending(&self) -> usize {
        let dropped = std::mem::take(&mut self.state.lock().mempool);
        debug!(dropped = dropped.len(), "Dropped pending transactions");
        dropped.len()
    }

    /// Append an event to the log without touching contract storage.
    pub fn inject_event(
        &self,
        kind: LedgerEventKind,
        fingerprint: IdentityFingerprint,
    ) -> LedgerEvent {
        let event = {
            let mut state = self.state.lock();
            state.block_number += 1;
            state.nonce += 1;
            let event = LedgerEvent {
                kind,
                fingerprint,
                block_number: state.block_number,
                tx_hash: transaction_hash(&self.contract_address, &fingerprint, state.nonce),
                log_index: 0,
            };
            state.events.push(event.clone());
            event
        };
        self.broadcast(std::slice::from_ref(&event));
        event
    }

    fn submit(
        &self,
        kind: LedgerEventKind,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Box<dyn PendingTransaction>, LedgerError> {
        let (reply, receiver) = oneshot::channel();
        let (tx_hash, auto_mine) = {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.reject_next) {
                return Err(LedgerError::Rejected);
            }
            state.nonce += 1;
            let tx_hash = transaction_hash(from, fingerprint, state.nonce);
            state.mempool.push(QueuedTransaction {
                kind,
                from: from.clone(),
                fingerprint: *fingerprint,
                tx_hash,
                reply,
            });
            (tx_hash, state.auto_mine)
        };

        debug!(tx_hash = %tx_hash, kind = ?kind, fingerprint = %fingerprint, "Transaction queued");
        if auto_mine {
            self.mine();
        }
        Ok(Box::new(InMemoryTransaction { tx_hash, receiver }))
    }

    fn broadcast(&self, events: &[LedgerEvent]) {
        let copies = if self.state.lock().duplicate_delivery { 2 } else { 1 };
        for event in events {
            let sender = match event.kind {
                LedgerEventKind::Registered => &self.registered_tx,
                LedgerEventKind::Verified => &self.verified_tx,
            };
            for _ in 0..copies {
                let _ = sender.send(event.clone());
            }
        }
    }

    fn check_reads(&self) -> Result<(), LedgerError> {
        if self.state.lock().fail_reads {
            return Err(LedgerError::Transport("ledger node unreachable".to_string()));
        }
        Ok(())
    }
}

impl LedgerState {
    fn execute(
        &mut self,
        tx: &QueuedTransaction,
        block_number: u64,
        log_index: u32,
    ) -> Result<Receipt, LedgerError> {
        let fingerprint = &tx.fingerprint;
        let revert = match tx.kind {
            LedgerEventKind::Registered if self.is_registered(fingerprint) => {
                Some("Identity already registered")
            }
            LedgerEventKind::Registered => None,
            LedgerEventKind::Verified if tx.from != self.verifier => {
                Some("Only verifier can call this")
            }
            LedgerEventKind::Verified if !self.is_registered(fingerprint) => {
                Some("Identity not registered")
            }
            LedgerEventKind::Verified if self.verified.contains(fingerprint) => {
                Some("Identity already verified")
            }
            LedgerEventKind::Verified => None,
        };
        if let Some(message) = revert {
            debug!(tx_hash = %tx.tx_hash, reason = message, "Transaction reverted");
            return Err(LedgerError::Reverted(RevertReason::classify(Some(message))));
        }

        match tx.kind {
            LedgerEventKind::Registered => {
                self.registrations.insert(*fingerprint, REGISTERED_FLAG);
            }
            LedgerEventKind::Verified => {
                self.verified.insert(*fingerprint);
            }
        }
        let event = LedgerEvent {
            kind: tx.kind,
            fingerprint: *fingerprint,
            block_number,
            tx_hash: tx.tx_hash,
            log_index,
        };
        self.events.push(event.clone());
        Ok(Receipt {
            tx_hash: tx.tx_hash,
            block_number,
            success: true,
            events: vec![event],
        })
    }

    fn is_registered(&self, fingerprint: &IdentityFingerprint) -> bool {
        self.registrations
            .get(fingerprint)
            .map(|flag| *flag == REGISTERED_FLAG)
            .unwrap_or(false)
    }
}

fn transaction_hash(from: &Address, fingerprint: &IdentityFingerprint, nonce: u64) -> TxHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(from.as_str().as_bytes());
    hasher.update(fingerprint.as_bytes());
    hasher.update(&nonce.to_be_bytes());
    TxHash(*hasher.finalize().as_bytes())
}

struct InMemoryTransaction {
    tx_hash: TxHash,
    receiver: oneshot::Receiver<Result<Receipt, LedgerError>>,
}

#[async_trait]
impl PendingTransaction for InMemoryTransaction {
    fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    async fn await_confirmation(self: Box<Self>) -> Result<Receipt, LedgerError> {
        self.receiver.await.unwrap_or(Err(LedgerError::Dropped))
    }
}

#[async_trait]
impl LedgerContract for InMemoryLedger {
    async fn verifier_address(&self) -> Result<Address, LedgerError> {
        self.check_reads()?;
        Ok(self.state.lock().verifier.clone())
    }

    async fn is_registered(&self, fingerprint: &IdentityFingerprint) -> Result<bool, LedgerError> {
        self.check_reads()?;
        Ok(self.state.lock().is_registered(fingerprint))
    }

    async fn is_verified(&self, fingerprint: &IdentityFingerprint) -> Result<bool, LedgerError> {
        self.check_reads()?;
        Ok(self.state.lock().verified.contains(fingerprint))
    }

    async fn register_identity(
        &self,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Box<dyn PendingTransaction>, LedgerError> {
        self.submit(LedgerEventKind::Registered, from, fingerprint)
    }

    async fn verify_identity(
        &self,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Box<dyn PendingTransaction>, LedgerError> {
        self.submit(LedgerEventKind::Verified, from, fingerprint)
    }

    async fn query_events(
        &self,
        kind: Option<LedgerEventKind>,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.check_reads()?;
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|event| kind.map_or(true, |kind| kind == event.kind))
            .cloned()
            .collect())
    }

    fn subscribe(&self, kind: LedgerEventKind) -> broadcast::Receiver<LedgerEvent> {
        match kind {
            LedgerEventKind::Registered => self.registered_tx.subscribe(),
            LedgerEventKind::Verified => self.verified_tx.subscribe(),
        }
    }
}

struct WalletState {
    accounts: Vec<Address>,
    rejecting: bool,
    unreachable: bool,
}

/// Scriptable wallet holding an ordered account list; the first entry is active.
pub struct InMemoryWallet {
    state: Mutex<WalletState>,
    changes: broadcast::Sender<Vec<Address>>,
}

impl InMemoryWallet {
    pub fn new(accounts: Vec<Address>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(WalletState {
                accounts,
                rejecting: false,
                unreachable: false,
            }),
            changes,
        }
    }

    pub fn with_account(account: Address) -> Self {
        Self::new(vec![account])
    }

    /// Make the user decline subsequent access requests.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Switch the active account list and notify listeners.
    pub fn switch_accounts(&self, accounts: Vec<Address>) {
        self.state.lock().accounts = accounts.clone();
        debug!(accounts = accounts.len(), "Wallet accounts switched");
        let _ = self.changes.send(accounts);
    }

    fn check_transport(&self) -> Result<(), WalletError> {
        if self.state.lock().unreachable {
            return Err(WalletError::Transport("wallet extension not responding".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletProvider for InMemoryWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        self.check_transport()?;
        let state = self.state.lock();
        if state.rejecting {
            return Err(WalletError::Rejected);
        }
        Ok(state.accounts.clone())
    }

    async fn current_accounts(&self) -> Result<Vec<Address>, WalletError> {
        self.check_transport()?;
        Ok(self.state.lock().accounts.clone())
    }

    fn accounts_changed(&self) -> broadcast::Receiver<Vec<Address>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idverify_core::config::{DEFAULT_CONTRACT_ADDRESS, DEFAULT_VERIFIER_ADDRESS};

    const USER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

    fn address(raw: &str) -> Address {
        Address::parse(raw).unwrap()
    }

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::from_config(&ClientConfig::default())
    }

    fn fingerprint(tag: u8) -> IdentityFingerprint {
        IdentityFingerprint::from_bytes([tag; 32])
    }

    #[tokio::test]
    async fn test_auto_mine_registers_and_emits() {
        let ledger = ledger();
        assert_eq!(ledger.contract_address().as_str(), DEFAULT_CONTRACT_ADDRESS);
        let mut live = ledger.subscribe(LedgerEventKind::Registered);

        let pending = ledger
            .register_identity(&address(USER), &fingerprint(1))
            .await
            .unwrap();
        let receipt = pending.await_confirmation().await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 1);
        assert!(ledger.is_registered(&fingerprint(1)).await.unwrap());
        assert!(!ledger.is_verified(&fingerprint(1)).await.unwrap());

        let event = live.recv().await.unwrap();
        assert_eq!(event.fingerprint, fingerprint(1));
        assert_eq!(event.tx_hash, receipt.tx_hash);
    }

    #[tokio::test]
    async fn test_contract_reverts() {
        let ledger = ledger();
        let user = address(USER);
        let verifier = address(DEFAULT_VERIFIER_ADDRESS);
        let fp = fingerprint(2);

        let not_registered = ledger.verify_identity(&verifier, &fp).await.unwrap();
        assert_eq!(
            not_registered.await_confirmation().await.unwrap_err(),
            LedgerError::Reverted(RevertReason::Message("Identity not registered".to_string()))
        );

        ledger.register_identity(&user, &fp).await.unwrap().await_confirmation().await.unwrap();
        let again = ledger.register_identity(&user, &fp).await.unwrap();
        assert_eq!(
            again.await_confirmation().await.unwrap_err(),
            LedgerError::Reverted(RevertReason::AlreadyRegistered)
        );

        let by_user = ledger.verify_identity(&user, &fp).await.unwrap();
        assert!(matches!(
            by_user.await_confirmation().await,
            Err(LedgerError::Reverted(RevertReason::Message(_)))
        ));

        ledger.verify_identity(&verifier, &fp).await.unwrap().await_confirmation().await.unwrap();
        let twice = ledger.verify_identity(&verifier, &fp).await.unwrap();
        assert_eq!(
            twice.await_confirmation().await.unwrap_err(),
            LedgerError::Reverted(RevertReason::AlreadyVerified)
        );
        assert_eq!(ledger.events().len(), 2);
    }

    #[tokio::test]
    async fn test_manual_mining_batches_into_one_block() {
        let ledger = ledger();
        ledger.set_auto_mine(false);
        let user = address(USER);
        let first = ledger.register_identity(&user, &fingerprint(3)).await.unwrap();
        let second = ledger.register_identity(&user, &fingerprint(4)).await.unwrap();
        assert_ne!(first.tx_hash(), second.tx_hash());
        assert_eq!(ledger.pending_transactions(), 2);
        assert_eq!(ledger.block_number(), 0);

        assert_eq!(ledger.mine(), 2);
        let first = first.await_confirmation().await.unwrap();
        let second = second.await_confirmation().await.unwrap();
        assert_eq!(first.block_number, second.block_number);
        assert_eq!(second.events[0].log_index, 1);
        assert_eq!(ledger.mine(), 0);
    }

    #[tokio::test]
    async fn test_dropped_and_rejected_transactions() {
        let ledger = ledger();
        ledger.set_auto_mine(false);
        let pending = ledger
            .register_identity(&address(USER), &fingerprint(5))
            .await
            .unwrap();
        assert_eq!(ledger.drop_pending(), 1);
        assert_eq!(pending.await_confirmation().await.unwrap_err(), LedgerError::Dropped);
        assert!(!ledger.is_registered(&fingerprint(5)).await.unwrap());

        ledger.reject_next_submission();
        assert!(matches!(
            ledger.register_identity(&address(USER), &fingerprint(5)).await,
            Err(LedgerError::Rejected)
        ));
        assert!(ledger
            .register_identity(&address(USER), &fingerprint(5))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_and_read_failures() {
        let ledger = ledger();
        ledger.set_duplicate_delivery(true);
        let mut live = ledger.subscribe(LedgerEventKind::Verified);
        let event = ledger.inject_event(LedgerEventKind::Verified, fingerprint(6));
        assert_eq!(live.recv().await.unwrap(), event);
        assert_eq!(live.recv().await.unwrap(), event);

        ledger.set_fail_reads(true);
        assert!(matches!(
            ledger.query_events(None).await,
            Err(LedgerError::Transport(_))
        ));
        assert!(ledger.verifier_address().await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_changes_verifier() {
        let ledger = ledger();
        ledger.rotate_verifier(address(USER));
        assert_eq!(ledger.verifier_address().await.unwrap(), address(USER));
    }

    #[tokio::test]
    async fn test_wallet_behaviour() {
        let wallet = InMemoryWallet::with_account(address(USER));
        assert_eq!(wallet.request_accounts().await.unwrap(), vec![address(USER)]);

        let mut changes = wallet.accounts_changed();
        wallet.switch_accounts(vec![]);
        assert!(changes.recv().await.unwrap().is_empty());
        assert!(wallet.current_accounts().await.unwrap().is_empty());

        wallet.set_rejecting(true);
        assert_eq!(wallet.request_accounts().await.unwrap_err(), WalletError::Rejected);

        wallet.set_unreachable(true);
        assert!(matches!(
            wallet.current_accounts().await,
            Err(WalletError::Transport(_))
        ));
    }
}
