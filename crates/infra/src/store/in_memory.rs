use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use tagtrail_core::{MovementId, TagId};
use tagtrail_inventory::{MovementRecord, SyncState, TrackedUnit, UnitMoved};

use super::r#trait::{StoreError, UnitStore};

#[derive(Debug, Default)]
struct State {
    units: BTreeMap<TagId, TrackedUnit>,
    movements: Vec<MovementRecord>,
    last_id: MovementId,
}

/// In-memory registry + ledger.
///
/// Intended for tests/dev. A single lock covers both maps, which makes
/// `commit_move` trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryUnitStore {
    state: RwLock<State>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl UnitStore for InMemoryUnitStore {
    async fn provision(&self, unit: TrackedUnit) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        if state.units.contains_key(unit.tag_id()) {
            return Err(StoreError::AlreadyExists(unit.tag_id().clone()));
        }
        state.units.insert(unit.tag_id().clone(), unit);
        Ok(())
    }

    async fn get_unit(&self, tag_id: &TagId) -> Result<Option<TrackedUnit>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.units.get(tag_id).cloned())
    }

    async fn list_units(&self) -> Result<Vec<TrackedUnit>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.units.values().cloned().collect())
    }

    async fn commit_move(&self, event: &UnitMoved) -> Result<MovementRecord, StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        let next_id = state.last_id.next();

        let unit = state
            .units
            .get_mut(&event.tag_id)
            .ok_or_else(|| StoreError::NotFound(event.tag_id.clone()))?;

        if unit.location() != &event.from_location {
            return Err(StoreError::Conflict {
                tag_id: event.tag_id.clone(),
                expected: event.from_location.clone(),
                actual: unit.location().clone(),
            });
        }

        unit.apply(event);
        let record = MovementRecord::committed(next_id, event);
        state.movements.push(record.clone());
        state.last_id = next_id;

        Ok(record)
    }

    async fn movements_for(&self, tag_id: &TagId) -> Result<Vec<MovementRecord>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .movements
            .iter()
            .filter(|m| &m.tag_id == tag_id)
            .cloned()
            .collect())
    }

    async fn movement(&self, id: MovementId) -> Result<Option<MovementRecord>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.movements.iter().find(|m| m.id == id).cloned())
    }

    async fn unsynced_movements(
        &self,
        tag_id: Option<&TagId>,
    ) -> Result<Vec<MovementRecord>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.external_synced != SyncState::Confirmed)
            .filter(|m| tag_id.is_none_or(|t| &m.tag_id == t))
            .cloned()
            .collect())
    }

    async fn set_sync_state(&self, id: MovementId, next: SyncState) -> Result<bool, StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        let record = state
            .movements
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::RecordNotFound(id))?;

        if !record.external_synced.can_advance_to(next) {
            return Ok(false);
        }
        let changed = record.external_synced != next;
        record.external_synced = next;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tagtrail_core::Location;
    use tagtrail_inventory::UnitStatus;

    use super::*;

    fn loc(s: &str) -> Location {
        Location::parse(s).unwrap()
    }

    fn moved(tag: &str, from: &str, to: &str) -> UnitMoved {
        UnitMoved {
            tag_id: TagId::new(tag),
            from_location: loc(from),
            to_location: loc(to),
            occurred_at: Utc::now(),
        }
    }

    async fn store_with(tag: &str, location: &str) -> InMemoryUnitStore {
        let store = InMemoryUnitStore::new();
        store
            .provision(TrackedUnit::new(
                TagId::new(tag),
                loc(location),
                UnitStatus::Other("Quarantine".into()),
                Utc::now(),
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn commit_updates_registry_and_appends_pending_record() {
        let store = store_with("T1", "VegRoom").await;

        let record = store.commit_move(&moved("T1", "VegRoom", "FlowerRoom")).await.unwrap();
        assert_eq!(record.id, MovementId::new(1));
        assert_eq!(record.external_synced, SyncState::Pending);

        let unit = store.get_unit(&TagId::new("T1")).await.unwrap().unwrap();
        assert_eq!(unit.location(), &loc("FlowerRoom"));
        assert_eq!(unit.status(), &UnitStatus::Active);
        assert_eq!(store.movements_for(&TagId::new("T1")).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn stale_commit_is_a_conflict_and_writes_nothing() {
        let store = store_with("T1", "FlowerRoom").await;

        let err = store.commit_move(&moved("T1", "VegRoom", "DryRoom")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let unit = store.get_unit(&TagId::new("T1")).await.unwrap().unwrap();
        assert_eq!(unit.location(), &loc("FlowerRoom"));
        assert!(store.movements_for(&TagId::new("T1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_unit_is_not_found() {
        let store = InMemoryUnitStore::new();
        let err = store.commit_move(&moved("ghost", "A", "B")).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(TagId::new("ghost")));
    }

    #[tokio::test]
    async fn duplicate_provisioning_is_rejected() {
        let store = store_with("T1", "VegRoom").await;
        let again = TrackedUnit::new(TagId::new("T1"), loc("X"), UnitStatus::Active, Utc::now());
        assert!(matches!(
            store.provision(again).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn sync_state_never_regresses() {
        let store = store_with("T1", "A").await;
        let record = store.commit_move(&moved("T1", "A", "B")).await.unwrap();

        assert!(store.set_sync_state(record.id, SyncState::Failed).await.unwrap());
        assert!(store.set_sync_state(record.id, SyncState::Confirmed).await.unwrap());
        assert!(!store.set_sync_state(record.id, SyncState::Failed).await.unwrap());

        let stored = store.movement(record.id).await.unwrap().unwrap();
        assert_eq!(stored.external_synced, SyncState::Confirmed);
        assert!(store.unsynced_movements(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsynced_listing_filters_by_unit_in_commit_order() {
        let store = store_with("T1", "A").await;
        store
            .provision(TrackedUnit::new(TagId::new("T2"), loc("A"), UnitStatus::Active, Utc::now()))
            .await
            .unwrap();

        store.commit_move(&moved("T1", "A", "B")).await.unwrap();
        store.commit_move(&moved("T2", "A", "C")).await.unwrap();
        store.commit_move(&moved("T1", "B", "C")).await.unwrap();

        let all = store.unsynced_movements(None).await.unwrap();
        let ids: Vec<u64> = all.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let t1 = store.unsynced_movements(Some(&TagId::new("T1"))).await.unwrap();
        let ids: Vec<u64> = t1.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
