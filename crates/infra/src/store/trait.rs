use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tagtrail_core::{Location, MovementId, TagId};
use tagtrail_inventory::{MovementRecord, SyncState, TrackedUnit, UnitMoved};

/// Registry/ledger operation error.
///
/// These are **infrastructure errors** as opposed to domain errors. `NotFound`
/// and `Conflict` are the store's own compare-and-swap verdicts, reported
/// when a commit races a change the caller did not see.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unit {0} not found")]
    NotFound(TagId),

    #[error("unit {tag_id} is in {actual}, expected {expected}")]
    Conflict {
        tag_id: TagId,
        expected: Location,
        actual: Location,
    },

    #[error("unit {0} already exists")]
    AlreadyExists(TagId),

    #[error("movement record {0} not found")]
    RecordNotFound(MovementId),

    /// Durability failure (IO, database, corrupt row). Nothing was committed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/// Durable Unit Registry + append-only Movement Ledger.
///
/// The two live behind one boundary because a move must update both or
/// neither.
///
/// ## Commit Semantics
///
/// `commit_move()`:
/// - compares the unit's stored location with `event.from_location` and
///   fails with `Conflict` on mismatch (native compare-and-swap)
/// - updates `location`, `status = Active`, `last_updated`
/// - appends a `pending` movement record with the next sequence number
/// - is atomic: on any error, neither write is visible
/// - is durable before it returns `Ok`
///
/// ## Read Semantics
///
/// Reads observe every commit that returned before the read started.
/// Movement listings are in ascending id (commit) order.
///
/// ## Sync State
///
/// `set_sync_state()` only moves forward (see `SyncState::can_advance_to`);
/// a regressive update is ignored and reported as `Ok(false)`.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Out-of-band provisioning of a new unit.
    async fn provision(&self, unit: TrackedUnit) -> Result<(), StoreError>;

    async fn get_unit(&self, tag_id: &TagId) -> Result<Option<TrackedUnit>, StoreError>;

    /// All units, ordered by tag.
    async fn list_units(&self) -> Result<Vec<TrackedUnit>, StoreError>;

    /// Atomically apply a move to the registry and append it to the ledger.
    async fn commit_move(&self, event: &UnitMoved) -> Result<MovementRecord, StoreError>;

    /// Ledger entries of one unit, oldest first.
    async fn movements_for(&self, tag_id: &TagId) -> Result<Vec<MovementRecord>, StoreError>;

    async fn movement(&self, id: MovementId) -> Result<Option<MovementRecord>, StoreError>;

    /// Records not yet confirmed by the external ledger, oldest first,
    /// optionally restricted to one unit.
    async fn unsynced_movements(
        &self,
        tag_id: Option<&TagId>,
    ) -> Result<Vec<MovementRecord>, StoreError>;

    /// Advance a record's sync state. Returns whether the state changed.
    async fn set_sync_state(&self, id: MovementId, state: SyncState) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> UnitStore for Arc<S>
where
    S: UnitStore + ?Sized,
{
    async fn provision(&self, unit: TrackedUnit) -> Result<(), StoreError> {
        (**self).provision(unit).await
    }

    async fn get_unit(&self, tag_id: &TagId) -> Result<Option<TrackedUnit>, StoreError> {
        (**self).get_unit(tag_id).await
    }

    async fn list_units(&self) -> Result<Vec<TrackedUnit>, StoreError> {
        (**self).list_units().await
    }

    async fn commit_move(&self, event: &UnitMoved) -> Result<MovementRecord, StoreError> {
        (**self).commit_move(event).await
    }

    async fn movements_for(&self, tag_id: &TagId) -> Result<Vec<MovementRecord>, StoreError> {
        (**self).movements_for(tag_id).await
    }

    async fn movement(&self, id: MovementId) -> Result<Option<MovementRecord>, StoreError> {
        (**self).movement(id).await
    }

    async fn unsynced_movements(
        &self,
        tag_id: Option<&TagId>,
    ) -> Result<Vec<MovementRecord>, StoreError> {
        (**self).unsynced_movements(tag_id).await
    }

    async fn set_sync_state(&self, id: MovementId, state: SyncState) -> Result<bool, StoreError> {
        (**self).set_sync_state(id, state).await
    }
}
