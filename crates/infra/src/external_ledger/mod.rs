//! External regulatory ledger boundary.
//!
//! The reconciliation worker talks to the external system only through
//! `ExternalLedger`. Every submission carries a stable idempotency key
//! derived from the movement itself, so a retried submission is
//! recognizable as the same move.
//!
//! # Failure classes
//!
//! - **Transient**: timeout, transport error, HTTP 408 / 429 / 5xx, or no
//!   credentials configured. Retried with backoff.
//! - **Rejected**: any other non-success status. Never retried automatically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use tagtrail_core::{Location, TagId};
use tagtrail_inventory::MovementRecord;

use crate::retry_queue::FailureReason;

pub mod http;
pub mod recording;

pub use http::{HttpLedgerClient, LedgerCredentials};
pub use recording::{Behavior, RecordingLedger};

/// One move as the external ledger sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LedgerSubmission {
    pub unit_label: TagId,
    pub destination_room: Location,
    pub move_timestamp: DateTime<Utc>,
}

impl LedgerSubmission {
    pub fn from_record(record: &MovementRecord) -> Self {
        Self {
            unit_label: record.tag_id.clone(),
            destination_room: record.to_location.clone(),
            move_timestamp: record.timestamp,
        }
    }

    /// Same move, same key: `{label}@{timestamp}`.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}@{}",
            self.unit_label,
            self.move_timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("external ledger answered HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("external ledger credentials are not configured")]
    NotConfigured,
}

impl SubmitError {
    /// Retry class of this failure.
    pub fn reason(&self) -> FailureReason {
        match self {
            SubmitError::Timeout(_) | SubmitError::Transport(_) | SubmitError::NotConfigured => {
                FailureReason::Transient
            }
            SubmitError::Status { status, .. } if is_transient_status(*status) => {
                FailureReason::Transient
            }
            SubmitError::Status { .. } => FailureReason::Rejected,
        }
    }
}

/// 408, 429 and every 5xx are worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Outbound client for the external regulatory ledger.
///
/// `submit` resolves once the external system accepted the move. Callers
/// bound it with their own timeout; implementations may also time out.
#[async_trait]
pub trait ExternalLedger: Send + Sync {
    async fn submit(&self, submission: &LedgerSubmission) -> Result<(), SubmitError>;
}

#[async_trait]
impl<L> ExternalLedger for Arc<L>
where
    L: ExternalLedger + ?Sized,
{
    async fn submit(&self, submission: &LedgerSubmission) -> Result<(), SubmitError> {
        (**self).submit(submission).await
    }
}

/// Stand-in used when no API key or license is configured.
///
/// Every submission fails transiently, so records accumulate in the retry
/// queue until credentials are provided and the service restarts.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredLedger;

#[async_trait]
impl ExternalLedger for UnconfiguredLedger {
    async fn submit(&self, _submission: &LedgerSubmission) -> Result<(), SubmitError> {
        Err(SubmitError::NotConfigured)
    }
}
