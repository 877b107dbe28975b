//! Minimal collaborators for unit tests inside this crate.

use crate::fingerprint::IdentityFingerprint;
use crate::ledger::{
    LedgerContract, LedgerError, LedgerEvent, LedgerEventKind, PendingTransaction, Receipt,
    RevertReason, TxHash,
};
use crate::types::Address;
use crate::wallet::{WalletError, WalletProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Notify};

pub(crate) const VERIFIER: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
pub(crate) const USER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

pub(crate) fn addr(raw: &str) -> Address {
    Address::parse(raw).unwrap()
}

pub(crate) fn fp(tag: u8) -> IdentityFingerprint {
    IdentityFingerprint::from_bytes([tag; 32])
}

pub(crate) fn event(kind: LedgerEventKind, fingerprint: IdentityFingerprint, block: u64) -> LedgerEvent {
    LedgerEvent {
        kind,
        fingerprint,
        block_number: block,
        tx_hash: TxHash([block as u8; 32]),
        log_index: 0,
    }
}

struct Held {
    kind: LedgerEventKind,
    from: Address,
    fingerprint: IdentityFingerprint,
    reply: oneshot::Sender<Result<Receipt, LedgerError>>,
}

struct FakeState {
    verifier: Address,
    registered: BTreeSet<IdentityFingerprint>,
    verified: BTreeSet<IdentityFingerprint>,
    events: Vec<LedgerEvent>,
    block: u64,
    fail_reads: bool,
    hold: bool,
    held: Vec<Held>,
    read_gate: Option<Arc<Notify>>,
}

pub(crate) struct FakeLedger {
    state: Mutex<FakeState>,
    registered_tx: broadcast::Sender<LedgerEvent>,
    verified_tx: broadcast::Sender<LedgerEvent>,
}

impl FakeLedger {
    pub(crate) fn new(verifier: &str) -> Self {
        let (registered_tx, _) = broadcast::channel(64);
        let (verified_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(FakeState {
                verifier: addr(verifier),
                registered: BTreeSet::new(),
                verified: BTreeSet::new(),
                events: Vec::new(),
                block: 0,
                fail_reads: false,
                hold: false,
                held: Vec::new(),
                read_gate: None,
            }),
            registered_tx,
            verified_tx,
        }
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub(crate) fn set_verifier(&self, verifier: &str) {
        self.state.lock().verifier = addr(verifier);
    }

    /// Verifier reads started from now on capture their value, then wait for the gate.
    pub(crate) fn gate_reads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().read_gate = Some(gate.clone());
        gate
    }

    pub(crate) fn open_reads(&self) {
        self.state.lock().read_gate = None;
    }

    /// Keep new transactions pending until `mine` is called.
    pub(crate) fn hold_transactions(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    pub(crate) fn mine(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for item in held {
            let result = self.execute(item.kind, &item.from, item.fingerprint);
            let _ = item.reply.send(result);
        }
    }

    /// Forget held transactions; their confirmations resolve as dropped.
    pub(crate) fn drop_held(&self) {
        self.state.lock().held.clear();
    }

    /// Emit an event without touching contract state.
    pub(crate) fn emit(&self, event: LedgerEvent) {
        self.state.lock().events.push(event.clone());
        let _ = self.sender(event.kind).send(event);
    }

    fn sender(&self, kind: LedgerEventKind) -> &broadcast::Sender<LedgerEvent> {
        match kind {
            LedgerEventKind::Registered => &self.registered_tx,
            LedgerEventKind::Verified => &self.verified_tx,
        }
    }

    fn execute(
        &self,
        kind: LedgerEventKind,
        from: &Address,
        fingerprint: IdentityFingerprint,
    ) -> Result<Receipt, LedgerError> {
        let event = {
            let mut state = self.state.lock();
            let revert = match kind {
                LedgerEventKind::Registered if state.registered.contains(&fingerprint) => {
                    Some("Identity already registered")
                }
                LedgerEventKind::Verified if &state.verifier != from => {
                    Some("Only verifier can call this")
                }
                LedgerEventKind::Verified if !state.registered.contains(&fingerprint) => {
                    Some("Identity not registered")
                }
                LedgerEventKind::Verified if state.verified.contains(&fingerprint) => {
                    Some("Identity already verified")
                }
                _ => None,
            };
            if let Some(message) = revert {
                return Err(LedgerError::Reverted(RevertReason::classify(Some(message))));
            }
            match kind {
                LedgerEventKind::Registered => state.registered.insert(fingerprint),
                LedgerEventKind::Verified => state.verified.insert(fingerprint),
            };
            state.block += 1;
            let emitted = event(kind, fingerprint, state.block);
            state.events.push(emitted.clone());
            emitted
        };
        let _ = self.sender(kind).send(event.clone());
        Ok(Receipt {
            tx_hash: event.tx_hash,
            block_number: event.block_number,
            success: true,
            events: vec![event],
        })
    }

    fn dispatch(
        &self,
        kind: LedgerEventKind,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Box<dyn PendingTransaction> {
        let (reply, receiver) = oneshot::channel();
        let hold = self.state.lock().hold;
        if hold {
            self.state.lock().held.push(Held {
                kind,
                from: from.clone(),
                fingerprint: *fingerprint,
                reply,
            });
        } else {
            let _ = reply.send(self.execute(kind, from, *fingerprint));
        }
        Box::new(FakeTransaction {
            hash: TxHash(*fingerprint.as_bytes()),
            receiver,
        })
    }

    fn check_reads(&self) -> Result<(), LedgerError> {
        if self.state.lock().fail_reads {
            return Err(LedgerError::Transport("rpc unavailable".to_string()));
        }
        Ok(())
    }
}

struct FakeTransaction {
    hash: TxHash,
    receiver: oneshot::Receiver<Result<Receipt, LedgerError>>,
}

#[async_trait]
impl PendingTransaction for FakeTransaction {
    fn tx_hash(&self) -> TxHash {
        self.hash
    }

    async fn await_confirmation(self: Box<Self>) -> Result<Receipt, LedgerError> {
        self.receiver.await.unwrap_or(Err(LedgerError::Dropped))
    }
}

#[async_trait]
impl LedgerContract for FakeLedger {
    async fn verifier_address(&self) -> Result<Address, LedgerError> {
        self.check_reads()?;
        let (verifier, gate) = {
            let state = self.state.lock();
            (state.verifier.clone(), state.read_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(verifier)
    }

    async fn is_registered(&self, fingerprint: &IdentityFingerprint) -> Result<bool, LedgerError> {
        self.check_reads()?;
        Ok(self.state.lock().registered.contains(fingerprint))
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
        Ok(self.dispatch(LedgerEventKind::Registered, from, fingerprint))
    }

    async fn verify_identity(
        &self,
        from: &Address,
        fingerprint: &IdentityFingerprint,
    ) -> Result<Box<dyn PendingTransaction>, LedgerError> {
        Ok(self.dispatch(LedgerEventKind::Verified, from, fingerprint))
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
            .filter(|event| kind.map(|k| k == event.kind).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn subscribe(&self, kind: LedgerEventKind) -> broadcast::Receiver<LedgerEvent> {
        self.sender(kind).subscribe()
    }
}

pub(crate) struct FakeWallet {
    accounts: Mutex<Vec<Address>>,
    reject: bool,
    changes: broadcast::Sender<Vec<Address>>,
}

impl FakeWallet {
    pub(crate) fn new(accounts: &[&str]) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            accounts: Mutex::new(accounts.iter().map(|a| addr(a)).collect()),
            reject: false,
            changes,
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new(&[])
        }
    }

    pub(crate) fn switch_to(&self, accounts: &[&str]) {
        let accounts: Vec<Address> = accounts.iter().map(|a| addr(a)).collect();
        *self.accounts.lock() = accounts.clone();
        let _ = self.changes.send(accounts);
    }
}

#[async_trait]
impl WalletProvider for FakeWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        if self.reject {
            return Err(WalletError::Rejected);
        }
        Ok(self.accounts.lock().clone())
    }

    async fn current_accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(self.accounts.lock().clone())
    }

    fn accounts_changed(&self) -> broadcast::Receiver<Vec<Address>> {
        self.changes.subscribe()
    }
}
