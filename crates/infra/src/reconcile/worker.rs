//! Background reconciliation worker.

use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::instrument;

use tagtrail_core::{MovementId, TagId};
use tagtrail_inventory::{MovementRecord, SyncState};

use super::{
    CycleReport, InFlightUnits, ReconcileConfig, ReconcileError, ReconcileTrigger, Shutdown,
};
use crate::external_ledger::{ExternalLedger, LedgerSubmission, SubmitError};
use crate::retry_queue::{FailureReason, RetryEntry, RetryQueue};
use crate::store::UnitStore;

/// Drives movement records from `pending` to `confirmed` against the
/// external ledger.
pub struct Reconciler<S, Q, L> {
    store: S,
    queue: Q,
    ledger: L,
    config: ReconcileConfig,
    in_flight: InFlightUnits,
    wake: Arc<Notify>,
    shutdown: Shutdown,
}

/// Returned by `Reconciler::spawn`.
pub struct ReconcilerHandle {
    shutdown: Shutdown,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop the worker. Cycles that have not started are abandoned; a
    /// submission already in flight finishes within its timeout.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "reconciliation worker panicked");
        }
    }
}

impl<S, Q, L> Reconciler<S, Q, L>
where
    S: UnitStore + 'static,
    Q: RetryQueue + 'static,
    L: ExternalLedger + 'static,
{
    pub fn new(store: S, queue: Q, ledger: L, config: ReconcileConfig) -> Self {
        Self {
            store,
            queue,
            ledger,
            config,
            in_flight: InFlightUnits::new(),
            wake: Arc::new(Notify::new()),
            shutdown: Shutdown::new(),
        }
    }

    /// Commit hook for the transition engine.
    pub fn trigger(&self) -> ReconcileTrigger {
        ReconcileTrigger::new(self.wake.clone())
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Start the background loop.
    ///
    /// The loop first resumes whatever was left unsynced by a previous run,
    /// then runs a cycle whenever a commit wakes it or the retry interval
    /// elapses, until shut down.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let shutdown = self.shutdown.clone();

        let join = tokio::spawn(async move {
            tracing::info!("reconciliation worker started");

            let mut interval = tokio::time::interval(self.config.retry_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the resume cycle covers it.
            interval.tick().await;

            self.run_logged().await;

            loop {
                tokio::select! {
                    _ = self.shutdown.wait() => break,
                    _ = self.wake.notified() => {}
                    _ = interval.tick() => {}
                }
                if self.shutdown.is_triggered() {
                    break;
                }
                self.run_logged().await;
            }

            tracing::info!("reconciliation worker stopped");
        });

        ReconcilerHandle { shutdown, join }
    }

    async fn run_logged(&self) {
        match self.run_cycle(false).await {
            Ok(report) if report != CycleReport::default() => {
                tracing::info!(
                    attempted = report.attempted,
                    confirmed = report.confirmed,
                    failed = report.failed,
                    deferred = report.deferred,
                    skipped = report.skipped,
                    "reconciliation cycle finished"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "reconciliation cycle failed"),
        }
    }

    /// Run one reconciliation cycle over every unsynced record.
    ///
    /// `force` ignores backoff and rejection holds, which is how an operator
    /// pushes everything through right away.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, force: bool) -> Result<CycleReport, ReconcileError> {
        let mut report = CycleReport::default();

        let pending = self.store.unsynced_movements(None).await?;
        let mut units: Vec<TagId> = Vec::new();
        for record in &pending {
            if !units.contains(&record.tag_id) {
                units.push(record.tag_id.clone());
            }
        }

        for tag_id in &units {
            if self.shutdown.is_triggered() {
                tracing::info!("shutdown requested, abandoning reconciliation cycle");
                return Ok(report);
            }
            let Some(_claim) = self.in_flight.try_claim(tag_id) else {
                report.skipped += 1;
                continue;
            };
            // One unit's storage failure must not starve the others.
            if let Err(err) = self.reconcile_unit(tag_id, force, &mut report).await {
                tracing::error!(tag_id = %tag_id, error = %err, "reconciliation of unit failed");
            }
        }

        self.drop_stale_entries().await?;
        Ok(report)
    }

    /// Submit `tag_id`'s unsynced records in commit order, stopping at the
    /// first one that cannot go through now.
    async fn reconcile_unit(
        &self,
        tag_id: &TagId,
        force: bool,
        report: &mut CycleReport,
    ) -> Result<(), ReconcileError> {
        // Re-read under the claim: another cycle may have confirmed some.
        let records = self.store.unsynced_movements(Some(tag_id)).await?;

        for (idx, record) in records.iter().enumerate() {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            let now = Utc::now();
            let existing = self.queue.get(record.id).await?;
            if let Some(entry) = &existing
                && !force
                && !entry.is_due(now)
            {
                tracing::debug!(
                    record_id = record.id.value(),
                    reason = entry.reason.as_str(),
                    next_attempt_at = %entry.next_attempt_at,
                    "unit waiting on retry"
                );
                report.skipped += 1;
                report.deferred += self.defer(&records[idx + 1..], record.id, now).await?;
                return Ok(());
            }

            // A queued record is replayed from its entry, not re-derived.
            let submission = match &existing {
                Some(entry) => entry.submission(),
                None => LedgerSubmission::from_record(record),
            };

            report.attempted += 1;
            match self.submit(&submission).await {
                Ok(()) => {
                    self.store.set_sync_state(record.id, SyncState::Confirmed).await?;
                    if existing.is_some() {
                        self.queue.remove(record.id).await?;
                    }
                    report.confirmed += 1;
                    tracing::info!(
                        record_id = record.id.value(),
                        tag_id = %record.tag_id,
                        "movement confirmed by external ledger"
                    );
                }
                Err(err) => {
                    self.record_failure(record, existing, &err, now).await?;
                    report.failed += 1;
                    report.deferred += self.defer(&records[idx + 1..], record.id, now).await?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    async fn submit(&self, submission: &LedgerSubmission) -> Result<(), SubmitError> {
        match tokio::time::timeout(self.config.submit_timeout, self.ledger.submit(submission))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SubmitError::Timeout(self.config.submit_timeout)),
        }
    }

    /// Queue first, then mark failed: a crash in between leaves the record
    /// both queued and re-submittable.
    async fn record_failure(
        &self,
        record: &MovementRecord,
        existing: Option<RetryEntry>,
        err: &SubmitError,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let reason = err.reason();
        let mut entry = existing
            .unwrap_or_else(|| RetryEntry::new(record, reason, err.to_string(), now, now));
        let delay = self.config.backoff(entry.attempts.saturating_add(1));
        entry.record_attempt(reason, err.to_string(), now, after(now, delay, self.config.max_delay));

        tracing::warn!(
            record_id = record.id.value(),
            tag_id = %record.tag_id,
            reason = reason.as_str(),
            attempts = entry.attempts,
            error = %err,
            "external ledger submission failed"
        );

        self.queue.upsert(entry).await?;
        self.store.set_sync_state(record.id, SyncState::Failed).await?;
        Ok(())
    }

    /// Park `later` behind `blocker`. Returns how many new entries were written.
    async fn defer(
        &self,
        later: &[MovementRecord],
        blocker: MovementId,
        now: DateTime<Utc>,
    ) -> Result<usize, ReconcileError> {
        let mut parked = 0;
        for record in later {
            if self.queue.get(record.id).await?.is_some() {
                continue;
            }
            let entry = RetryEntry::new(
                record,
                FailureReason::Deferred,
                format!("waiting on record {blocker}"),
                now,
                now,
            );
            self.queue.upsert(entry).await?;
            parked += 1;
        }
        Ok(parked)
    }

    /// Remove queue entries whose record is already confirmed (or gone).
    async fn drop_stale_entries(&self) -> Result<(), ReconcileError> {
        for entry in self.queue.list().await? {
            if self.in_flight.is_claimed(&entry.tag_id) {
                continue;
            }
            let confirmed = match self.store.movement(entry.record_id).await? {
                Some(record) => record.external_synced == SyncState::Confirmed,
                None => true,
            };
            if confirmed {
                self.queue.remove(entry.record_id).await?;
                tracing::debug!(record_id = entry.record_id.value(), "dropped stale retry entry");
            }
        }
        Ok(())
    }

    /// Make a queued record eligible right away and wake the worker.
    ///
    /// This is the operator path for rejected records. Returns `false` when
    /// the record is not queued.
    #[instrument(skip(self), err)]
    pub async fn requeue(&self, record_id: MovementId) -> Result<bool, ReconcileError> {
        let Some(mut entry) = self.queue.get(record_id).await? else {
            return Ok(false);
        };
        if entry.reason == FailureReason::Rejected {
            entry.reason = FailureReason::Transient;
        }
        entry.next_attempt_at = Utc::now();
        self.queue.upsert(entry).await?;
        self.wake.notify_one();
        Ok(true)
    }

    /// Current retry queue contents, in record order.
    pub async fn retry_entries(&self) -> Result<Vec<RetryEntry>, ReconcileError> {
        Ok(self.queue.list().await?)
    }
}

/// `now + delay`, never later than `now + cap`. Falls back to `now` when even
/// the cap is out of range, so the result always survives an RFC3339 round trip.
fn after(now: DateTime<Utc>, delay: std::time::Duration, cap: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay.min(cap))
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .filter(|at| at.year() <= 9999)
        .unwrap_or(now)
}
