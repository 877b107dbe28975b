//! Reconciled identity status view.
//!
//! The ledger is authoritative; this is a local fold of its events and reads. Every merge is
//! a per-field monotone join (flags only turn on, blocks keep the earliest observation), so
//! applying updates in any order or more than once converges to the same state.

use crate::fingerprint::IdentityFingerprint;
use crate::ledger::{LedgerEvent, LedgerEventKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Unregistered,
    Pending,
    Verified,
}

/// Local view of one fingerprint's ledger state. Invariant: `verified` implies `registered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub fingerprint: IdentityFingerprint,
    pub registered: bool,
    pub verified: bool,
    pub registered_at_block: Option<u64>,
    pub verified_at_block: Option<u64>,
}

impl IdentityRecord {
    pub fn unregistered(fingerprint: IdentityFingerprint) -> Self {
        Self {
            fingerprint,
            registered: false,
            verified: false,
            registered_at_block: None,
            verified_at_block: None,
        }
    }

    pub fn status(&self) -> IdentityStatus {
        match (self.registered, self.verified) {
            (_, true) => IdentityStatus::Verified,
            (true, false) => IdentityStatus::Pending,
            (false, false) => IdentityStatus::Unregistered,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == IdentityStatus::Pending
    }

    /// Join another observation of the same fingerprint into this one.
    fn join(&mut self, other: &IdentityRecord) -> bool {
        let before = self.clone();
        self.registered |= other.registered || other.verified;
        self.verified |= other.verified;
        self.registered_at_block = earliest(self.registered_at_block, other.registered_at_block);
        self.verified_at_block = earliest(self.verified_at_block, other.verified_at_block);
        *self != before
    }

    fn observation(event: &LedgerEvent) -> Self {
        let mut record = Self::unregistered(event.fingerprint);
        match event.kind {
            LedgerEventKind::Registered => {
                record.registered = true;
                record.registered_at_block = Some(event.block_number);
            }
            LedgerEventKind::Verified => {
                record.registered = true;
                record.verified = true;
                record.verified_at_block = Some(event.block_number);
            }
        }
        record
    }
}

fn earliest(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Fingerprints that are registered and not yet verified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSet(BTreeSet<IdentityFingerprint>);

impl PendingSet {
    pub fn contains(&self, fingerprint: &IdentityFingerprint) -> bool {
        self.0.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityFingerprint> {
        self.0.iter()
    }
}

impl FromIterator<IdentityFingerprint> for PendingSet {
    fn from_iter<T: IntoIterator<Item = IdentityFingerprint>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of folding one event into the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub record: IdentityRecord,
    pub changed: bool,
    /// A `Verified` event arrived for a fingerprint with no registration on record.
    pub inconsistent: bool,
}

/// Shared status view keyed by fingerprint.
///
/// Readers may hold it freely; only the reconciler mutates it.
#[derive(Debug, Default)]
pub struct StatusView {
    records: RwLock<BTreeMap<IdentityFingerprint, IdentityRecord>>,
}

impl StatusView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &IdentityFingerprint) -> Option<IdentityRecord> {
        self.records.read().get(fingerprint).cloned()
    }

    /// Record for a fingerprint, or an unregistered placeholder if none was observed.
    pub fn record(&self, fingerprint: &IdentityFingerprint) -> IdentityRecord {
        self.get(fingerprint)
            .unwrap_or_else(|| IdentityRecord::unregistered(*fingerprint))
    }

    pub fn records(&self) -> Vec<IdentityRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn pending(&self) -> PendingSet {
        self.records
            .read()
            .values()
            .filter(|record| record.is_pending())
            .map(|record| record.fingerprint)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub(crate) fn apply(&self, event: &LedgerEvent) -> Applied {
        let mut records = self.records.write();
        let record = records
            .entry(event.fingerprint)
            .or_insert_with(|| IdentityRecord::unregistered(event.fingerprint));
        let inconsistent = event.kind == LedgerEventKind::Verified && !record.registered;
        let changed = record.join(&IdentityRecord::observation(event));
        Applied {
            record: record.clone(),
            changed,
            inconsistent,
        }
    }

    /// Join an authoritative read. An unregistered read of an unknown fingerprint is not stored.
    pub(crate) fn merge(&self, observed: &IdentityRecord) -> Applied {
        let mut records = self.records.write();
        if observed.status() == IdentityStatus::Unregistered
            && !records.contains_key(&observed.fingerprint)
        {
            return Applied {
                record: observed.clone(),
                changed: false,
                inconsistent: false,
            };
        }
        let record = records
            .entry(observed.fingerprint)
            .or_insert_with(|| IdentityRecord::unregistered(observed.fingerprint));
        let changed = record.join(observed);
        Applied {
            record: record.clone(),
            changed,
            inconsistent: false,
        }
    }
}
