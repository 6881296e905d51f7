//! External reconciliation.
//!
//! Keeps the external regulatory ledger in step with the movement ledger.
//! Runs strictly after commits and never feeds back into `move_unit`.
//!
//! ## Record lifecycle
//!
//! ```text
//! pending ──submit ok──────────────→ confirmed
//!    │
//!    └──submit failed──→ failed ──retry ok──→ confirmed
//!                          │
//!                          └── retry queue entry until confirmed
//! ```
//!
//! ## Ordering
//!
//! Records of one unit are submitted in commit order. When one fails, the
//! later records of that unit are parked as `deferred` and wait for it.
//! Different units never wait for each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use tagtrail_inventory::MovementRecord;

use crate::retry_queue::RetryQueueError;
use crate::store::StoreError;
use crate::transition_engine::SyncTrigger;

pub mod in_flight;
pub mod worker;

pub use in_flight::{InFlightUnits, UnitClaim};
pub use worker::{Reconciler, ReconcilerHandle};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] RetryQueueError),
}

/// Timing knobs for the reconciliation worker.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upper bound on a single external submission.
    pub submit_timeout: Duration,
    /// Period of the background retry cycle.
    pub retry_interval: Duration,
    /// Delay before the first retry of a failed record.
    pub base_delay: Duration,
    /// Cap on the exponential backoff.
    pub max_delay: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(30),
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl ReconcileConfig {
    /// Delay after the `attempts`-th consecutive failure:
    /// `base * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Counters for one reconciliation cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Submissions made.
    pub attempted: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Records parked behind an earlier failure of the same unit.
    pub deferred: usize,
    /// Units left alone: already in flight, or waiting on backoff / an operator.
    pub skipped: usize,
}

/// Cooperative shutdown signal shared by the worker and its handle.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called (immediately if it already was).
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Wakes the reconciliation worker after a commit. Never blocks.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    wake: Arc<Notify>,
}

impl ReconcileTrigger {
    pub(crate) fn new(wake: Arc<Notify>) -> Self {
        Self { wake }
    }
}

impl SyncTrigger for ReconcileTrigger {
    fn schedule(&self, record: &MovementRecord) {
        tracing::debug!(record_id = record.id.value(), "reconciliation scheduled");
        self.wake.notify_one();
    }
}
