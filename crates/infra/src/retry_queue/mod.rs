//! Durable retry queue for movement records the external ledger has not
//! accepted yet.
//!
//! One entry per movement record. An entry is written **before** the record
//! is marked `failed` and removed only **after** the record is marked
//! `confirmed`, so a crash between the two steps leaves a redundant entry
//! (cleaned up on the next cycle) and never a lost one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tagtrail_core::{Location, MovementId, TagId};
use tagtrail_inventory::MovementRecord;

use crate::external_ledger::LedgerSubmission;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryRetryQueue;
pub use sqlite::SqliteRetryQueue;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryQueueError {
    #[error("retry queue backend failure: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for RetryQueueError {
    fn from(value: sqlx::Error) -> Self {
        RetryQueueError::Backend(value.to_string())
    }
}

/// Why a record sits in the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// Timeout, transport error or a retryable status. Retried with backoff.
    Transient,
    /// The external ledger refused the submission. Waits for an operator.
    Rejected,
    /// Never submitted: an earlier record of the same unit is still failing.
    Deferred,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Transient => "transient",
            FailureReason::Rejected => "rejected",
            FailureReason::Deferred => "deferred",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "transient" => Some(FailureReason::Transient),
            "rejected" => Some(FailureReason::Rejected),
            "deferred" => Some(FailureReason::Deferred),
            _ => None,
        }
    }
}

/// A movement record awaiting (re)submission, with enough data to rebuild
/// the external request without touching the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub record_id: MovementId,
    pub tag_id: TagId,
    pub destination: Location,
    pub move_timestamp: DateTime<Utc>,
    pub reason: FailureReason,
    pub last_error: String,
    /// Failed submissions so far. Deferred entries have not been attempted.
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

impl RetryEntry {
    /// Entry for a record that has not been queued before.
    pub fn new(
        record: &MovementRecord,
        reason: FailureReason,
        error: impl Into<String>,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: record.id,
            tag_id: record.tag_id.clone(),
            destination: record.to_location.clone(),
            move_timestamp: record.timestamp,
            reason,
            last_error: error.into(),
            attempts: 0,
            first_failed_at: now,
            last_failed_at: now,
            next_attempt_at,
        }
    }

    /// Register one more failed submission.
    pub fn record_attempt(
        &mut self,
        reason: FailureReason,
        error: impl Into<String>,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) {
        self.reason = reason;
        self.last_error = error.into();
        self.attempts = self.attempts.saturating_add(1);
        self.last_failed_at = now;
        self.next_attempt_at = next_attempt_at;
    }

    /// Whether the automatic retry cycle may submit this entry at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.reason != FailureReason::Rejected && self.next_attempt_at <= now
    }

    /// The external request this entry stands for.
    pub fn submission(&self) -> LedgerSubmission {
        LedgerSubmission {
            unit_label: self.tag_id.clone(),
            destination_room: self.destination.clone(),
            move_timestamp: self.move_timestamp,
        }
    }
}

/// Durable store of `RetryEntry`, keyed by record id.
///
/// Entries survive restarts. `list()` returns them in record (commit) order.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Insert or replace the entry for `entry.record_id`.
    async fn upsert(&self, entry: RetryEntry) -> Result<(), RetryQueueError>;

    async fn get(&self, record_id: MovementId) -> Result<Option<RetryEntry>, RetryQueueError>;

    async fn list(&self) -> Result<Vec<RetryEntry>, RetryQueueError>;

    /// Returns whether an entry was removed.
    async fn remove(&self, record_id: MovementId) -> Result<bool, RetryQueueError>;

    async fn len(&self) -> Result<usize, RetryQueueError>;
}

#[async_trait]
impl<Q> RetryQueue for Arc<Q>
where
    Q: RetryQueue + ?Sized,
{
    async fn upsert(&self, entry: RetryEntry) -> Result<(), RetryQueueError> {
        (**self).upsert(entry).await
    }

    async fn get(&self, record_id: MovementId) -> Result<Option<RetryEntry>, RetryQueueError> {
        (**self).get(record_id).await
    }

    async fn list(&self) -> Result<Vec<RetryEntry>, RetryQueueError> {
        (**self).list().await
    }

    async fn remove(&self, record_id: MovementId) -> Result<bool, RetryQueueError> {
        (**self).remove(record_id).await
    }

    async fn len(&self) -> Result<usize, RetryQueueError> {
        (**self).len().await
    }
}
