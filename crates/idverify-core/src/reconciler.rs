//! Ledger event replay and live reconciliation into the status view.

use crate::error::IdentityError;
use crate::fingerprint::IdentityFingerprint;
use crate::ledger::{LedgerContract, LedgerEvent, LedgerEventKind};
use crate::view::{Applied, IdentityRecord, PendingSet, StatusView};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notification delivered to subscribers after a record changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileUpdate {
    pub record: IdentityRecord,
    pub pending: PendingSet,
}

pub type UpdateHandler = Arc<dyn Fn(&ReconcileUpdate) + Send + Sync>;

/// Live event listeners for both event kinds.
///
/// Released exactly once, by [`Subscription::unsubscribe`] or on drop, including while an
/// update is mid-flight.
#[must_use = "dropping the subscription detaches the live listeners"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Folds historical and live ledger events into the shared [`StatusView`].
#[derive(Clone)]
pub struct EventReconciler {
    ledger: Arc<dyn LedgerContract>,
    view: Arc<StatusView>,
}

impl EventReconciler {
    pub fn new(ledger: Arc<dyn LedgerContract>, view: Arc<StatusView>) -> Self {
        Self { ledger, view }
    }

    pub fn view(&self) -> &Arc<StatusView> {
        &self.view
    }

    pub fn pending(&self) -> PendingSet {
        self.view.pending()
    }

    /// Replay all historical events. Query failures are logged and yield no records.
    pub async fn load_history(&self) -> Vec<IdentityRecord> {
        match self.try_load_history().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "History load failed; continuing with an empty view");
                Vec::new()
            }
        }
    }

    pub async fn try_load_history(&self) -> Result<Vec<IdentityRecord>, IdentityError> {
        let mut events = self
            .ledger
            .query_events(None)
            .await
            .map_err(|e| IdentityError::ReadError(e.to_string()))?;

        // Registrations first so a batch cannot report a verification as orphaned merely
        // because of its position in the query result.
        events.sort_by_key(|event| {
            (
                event.kind != LedgerEventKind::Registered,
                event.block_number,
                event.log_index,
            )
        });

        let mut touched = BTreeSet::new();
        for event in &events {
            self.fold(event);
            touched.insert(event.fingerprint);
        }

        info!(
            events = events.len(),
            identities = touched.len(),
            pending = self.view.pending().len(),
            "Loaded ledger history"
        );
        Ok(touched.iter().map(|fp| self.view.record(fp)).collect())
    }

    /// Point-in-time authoritative read for one fingerprint, merged into the view.
    pub async fn refresh(
        &self,
        fingerprint: &IdentityFingerprint,
    ) -> Result<IdentityRecord, IdentityError> {
        let registered = self
            .ledger
            .is_registered(fingerprint)
            .await
            .map_err(|e| IdentityError::ReadError(e.to_string()))?;
        let verified = if registered {
            self.ledger
                .is_verified(fingerprint)
                .await
                .map_err(|e| IdentityError::ReadError(e.to_string()))?
        } else {
            false
        };

        let mut observed = IdentityRecord::unregistered(*fingerprint);
        observed.registered = registered;
        observed.verified = verified;
        let applied = self.view.merge(&observed);
        debug!(
            fingerprint = %fingerprint,
            registered,
            verified,
            changed = applied.changed,
            "Refreshed identity status"
        );
        Ok(applied.record)
    }

    /// Apply one event to the view. Safe to call with duplicates.
    pub fn apply_event(&self, event: &LedgerEvent) -> Applied {
        self.fold(event)
    }

    /// Attach live listeners for `Registered` and `Verified` events.
    ///
    /// `on_update` runs after each event that changed a record. If the live stream lags,
    /// the history is replayed so the view still converges, and each record the replay
    /// changed is reported with the resulting pending set.
    pub fn subscribe(&self, on_update: UpdateHandler) -> Subscription {
        let mut registered = self.ledger.subscribe(LedgerEventKind::Registered);
        let mut verified = self.ledger.subscribe(LedgerEventKind::Verified);
        let reconciler = self.clone();

        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = registered.recv() => received,
                    received = verified.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let applied = reconciler.fold(&event);
                        if applied.changed {
                            on_update(&ReconcileUpdate {
                                record: applied.record,
                                pending: reconciler.view.pending(),
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Live event stream lagged; replaying history");
                        reconciler.replay_after_lag(&on_update).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Ledger event stream closed");
                        break;
                    }
                }
            }
        });

        Subscription { task }
    }

    /// Replay history and report every record the replay changed.
    async fn replay_after_lag(&self, on_update: &UpdateHandler) {
        let before: BTreeMap<IdentityFingerprint, IdentityRecord> = self
            .view
            .records()
            .into_iter()
            .map(|record| (record.fingerprint, record))
            .collect();
        self.load_history().await;

        let pending = self.view.pending();
        let mut reported = 0usize;
        for record in self.view.records() {
            if before.get(&record.fingerprint) == Some(&record) {
                continue;
            }
            on_update(&ReconcileUpdate {
                record,
                pending: pending.clone(),
            });
            reported += 1;
        }
        debug!(reported, pending = pending.len(), "Reported records changed by replay");
    }

    fn fold(&self, event: &LedgerEvent) -> Applied {
        let applied = self.view.apply(event);
        if applied.inconsistent {
            warn!(
                error = %IdentityError::InconsistentEvent(event.fingerprint),
                block = event.block_number,
                "Marking identity verified despite missing registration"
            );
        }
        if applied.changed {
            debug!(
                fingerprint = %event.fingerprint,
                kind = ?event.kind,
                block = event.block_number,
                "Reconciled ledger event"
            );
        } else {
            debug!(
                fingerprint = %event.fingerprint,
                kind = ?event.kind,
                "Ignored duplicate ledger event"
            );
        }
        applied
    }
}
