//! Move execution pipeline.
//!
//! ## Move Flow
//!
//! ```text
//! MoveRequest
//!   ↓
//! 1. Take the per-unit lock (same unit: serialized; different units: parallel)
//!   ↓
//! 2. Load the unit                                  → NotFound
//!   ↓
//! 3. Decide (location compare-and-swap, then destination check)
//!                                                   → Conflict / InvalidArgument
//!   ↓
//! 4. Commit registry update + ledger append atomically → Storage
//!   ↓
//! 5. Release the lock
//!   ↓
//! 6. Publish UnitMoved to observers (best-effort)
//!   ↓
//! 7. Wake the reconciliation worker (never awaited)
//! ```
//!
//! Steps 6 and 7 happen only after a durable commit and can never turn a
//! committed move into a failed one. External-sync outcomes do not reach
//! the caller at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;

use tagtrail_core::{DomainError, Location, TagId};
use tagtrail_events::EventBus;
use tagtrail_inventory::{MoveUnit, MovementRecord, TrackedUnit, UnitMoved, UnitStatus};

use crate::store::{StoreError, UnitStore};

/// A move as submitted by a caller. Raw strings: validation is part of the
/// engine's ordered checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub tag_id: String,
    pub from_location: String,
    pub to_location: String,
}

impl MoveRequest {
    pub fn new(
        tag_id: impl Into<String>,
        from_location: impl Into<String>,
        to_location: impl Into<String>,
    ) -> Self {
        Self {
            tag_id: tag_id.into(),
            from_location: from_location.into(),
            to_location: to_location.into(),
        }
    }
}

/// Outcome of a failed `move_unit`. Nothing was written in any of these cases.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<DomainError> for MoveError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotFound(m) => MoveError::NotFound(m),
            DomainError::Conflict(m) => MoveError::Conflict(m),
            DomainError::Validation(m) | DomainError::InvalidId(m) => MoveError::InvalidArgument(m),
        }
    }
}

impl From<StoreError> for MoveError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) | StoreError::RecordNotFound(_) => {
                MoveError::NotFound(value.to_string())
            }
            StoreError::Conflict { .. } | StoreError::AlreadyExists(_) => {
                MoveError::Conflict(value.to_string())
            }
            StoreError::Backend(m) => MoveError::Storage(m),
        }
    }
}

/// Hook invoked after every committed move.
///
/// Must return immediately; the reconciliation itself runs elsewhere.
pub trait SyncTrigger: Send + Sync {
    fn schedule(&self, record: &MovementRecord);
}

impl<T> SyncTrigger for Arc<T>
where
    T: SyncTrigger + ?Sized,
{
    fn schedule(&self, record: &MovementRecord) {
        (**self).schedule(record)
    }
}

/// Trigger for deployments without external reconciliation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSync;

impl SyncTrigger for NoSync {
    fn schedule(&self, _record: &MovementRecord) {}
}

/// Per-unit async mutexes, created on demand and reclaimed when unused.
#[derive(Debug, Default)]
pub struct UnitLocks {
    locks: Mutex<HashMap<TagId, Arc<tokio::sync::Mutex<()>>>>,
}

impl UnitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `tag_id`.
    pub async fn lock(&self, tag_id: &TagId) -> UnitGuard<'_> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(tag_id.clone()).or_default().clone()
        };
        let guard = entry.clone().lock_owned().await;

        UnitGuard {
            locks: self,
            tag_id: tag_id.clone(),
            entry,
            guard: Some(guard),
        }
    }

    /// Number of units with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct UnitGuard<'a> {
    locks: &'a UnitLocks,
    tag_id: TagId,
    entry: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            locks.remove(&self.tag_id);
        }
    }
}

/// Applies moves to the registry + ledger and fans out the results.
pub struct TransitionEngine<S, B, T> {
    store: S,
    bus: B,
    trigger: T,
    locks: UnitLocks,
}

impl<S, B, T> TransitionEngine<S, B, T>
where
    S: UnitStore,
    B: EventBus<UnitMoved>,
    T: SyncTrigger,
{
    pub fn new(store: S, bus: B, trigger: T) -> Self {
        Self {
            store,
            bus,
            trigger,
            locks: UnitLocks::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Move a unit from `from_location` to `to_location`.
    ///
    /// Errors are checked in order: unknown unit, stale `from_location`,
    /// malformed destination. On success the record is durable before this
    /// returns.
    #[instrument(skip(self, request), fields(tag_id = %request.tag_id), err)]
    pub async fn move_unit(&self, request: MoveRequest) -> Result<MovementRecord, MoveError> {
        let tag_id = TagId::new(request.tag_id);

        let record = {
            let _guard = self.locks.lock(&tag_id).await;

            let unit = self
                .store
                .get_unit(&tag_id)
                .await?
                .ok_or_else(|| MoveError::NotFound(format!("unit {tag_id} not found")))?;

            let command = MoveUnit {
                tag_id: tag_id.clone(),
                from_location: request.from_location,
                to_location: request.to_location,
                occurred_at: next_timestamp(unit.last_updated()),
            };
            let event = unit.decide_move(&command)?;

            self.store.commit_move(&event).await?
        };

        tracing::info!(
            record_id = record.id.value(),
            from = %record.from_location,
            to = %record.to_location,
            "unit moved"
        );

        if let Err(err) = self.bus.publish(record.to_event()) {
            tracing::warn!(record_id = record.id.value(), error = ?err, "fan-out failed");
        }
        self.trigger.schedule(&record);

        Ok(record)
    }

    /// Register a new unit at `location`.
    #[instrument(skip(self), err)]
    pub async fn provision(
        &self,
        tag_id: &str,
        location: &str,
        status: Option<&str>,
    ) -> Result<TrackedUnit, MoveError> {
        let tag_id = TagId::parse(tag_id)?;
        let location = Location::parse(location)?;
        let status = status.map(UnitStatus::parse).unwrap_or(UnitStatus::Active);

        let _guard = self.locks.lock(&tag_id).await;
        let unit = TrackedUnit::new(tag_id, location, status, Utc::now().trunc_subsecs(6));
        self.store.provision(unit.clone()).await?;
        Ok(unit)
    }

    pub async fn unit(&self, tag_id: &str) -> Result<TrackedUnit, MoveError> {
        let tag_id = TagId::new(tag_id);
        self.store
            .get_unit(&tag_id)
            .await?
            .ok_or_else(|| MoveError::NotFound(format!("unit {tag_id} not found")))
    }

    pub async fn units(&self) -> Result<Vec<TrackedUnit>, MoveError> {
        Ok(self.store.list_units().await?)
    }

    /// Ledger history of one unit, oldest first. Unknown units are `NotFound`.
    pub async fn history(&self, tag_id: &str) -> Result<Vec<MovementRecord>, MoveError> {
        let unit = self.unit(tag_id).await?;
        Ok(self.store.movements_for(unit.tag_id()).await?)
    }
}

/// Microsecond-precision commit time, strictly after the unit's last update
/// so two moves of one unit never share a timestamp.
fn next_timestamp(last_updated: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    let floor = last_updated.trunc_subsecs(6) + TimeDelta::microseconds(1);
    now.max(floor)
}
