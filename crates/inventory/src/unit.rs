use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tagtrail_core::{DomainError, DomainResult, Location, MovementId, TagId};
use tagtrail_events::Event;

/// Lifecycle status of a tracked unit.
///
/// `Active` is the only status this subsystem assigns (as a side effect of a
/// successful move). Facilities may provision units with their own statuses,
/// which are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UnitStatus {
    Active,
    Other(String),
}

impl UnitStatus {
    pub fn as_str(&self) -> &str {
        match self {
            UnitStatus::Active => "Active",
            UnitStatus::Other(s) => s,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "Active" => UnitStatus::Active,
            other => UnitStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for UnitStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<UnitStatus> for String {
    fn from(value: UnitStatus) -> Self {
        value.as_str().to_string()
    }
}

/// A uniquely tagged physical unit and its current location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedUnit {
    tag_id: TagId,
    location: Location,
    status: UnitStatus,
    last_updated: DateTime<Utc>,
}

impl TrackedUnit {
    /// Build a unit from its stored (or freshly provisioned) state.
    pub fn new(
        tag_id: TagId,
        location: Location,
        status: UnitStatus,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            tag_id,
            location,
            status,
            last_updated,
        }
    }

    pub fn tag_id(&self) -> &TagId {
        &self.tag_id
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn status(&self) -> &UnitStatus {
        &self.status
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Decide whether `cmd` may move this unit. Pure: no mutation, no IO.
    ///
    /// Checks, in order: the caller's `from_location` matches the current
    /// location (`Conflict` otherwise), then the destination is well-formed
    /// (`Validation` otherwise).
    pub fn decide_move(&self, cmd: &MoveUnit) -> DomainResult<UnitMoved> {
        if cmd.tag_id != self.tag_id {
            return Err(DomainError::validation("tag_id mismatch"));
        }

        if self.location.as_str() != cmd.from_location {
            return Err(DomainError::conflict(format!(
                "unit {} is in {}, not {}",
                self.tag_id, self.location, cmd.from_location
            )));
        }

        let to_location = Location::parse(&cmd.to_location)?;

        Ok(UnitMoved {
            tag_id: self.tag_id.clone(),
            from_location: self.location.clone(),
            to_location,
            occurred_at: cmd.occurred_at,
        })
    }

    /// Evolve state from a committed move.
    pub fn apply(&mut self, event: &UnitMoved) {
        self.location = event.to_location.clone();
        self.status = UnitStatus::Active;
        self.last_updated = event.occurred_at;
    }
}

/// Command: move a unit, guarded by the caller's view of its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveUnit {
    pub tag_id: TagId,
    pub from_location: String,
    pub to_location: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitMoved.
///
/// This is also the outbound notification shape:
/// `{tag_id, from_location, to_location, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMoved {
    pub tag_id: TagId,
    pub from_location: Location,
    pub to_location: Location,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

impl Event for UnitMoved {
    fn event_type(&self) -> &'static str {
        "unit.moved"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Progress of the external reconciliation for one movement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Confirmed,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Confirmed => "confirmed",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> DomainResult<Self> {
        match raw {
            "pending" => Ok(SyncState::Pending),
            "confirmed" => Ok(SyncState::Confirmed),
            "failed" => Ok(SyncState::Failed),
            other => Err(DomainError::validation(format!("unknown sync state '{other}'"))),
        }
    }

    /// Sync state only moves forward; `confirmed` is terminal.
    pub fn can_advance_to(self, next: SyncState) -> bool {
        match (self, next) {
            (SyncState::Confirmed, _) => false,
            (_, SyncState::Pending) => false,
            _ => true,
        }
    }
}

/// Append-only ledger entry for one committed move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub id: MovementId,
    pub tag_id: TagId,
    pub from_location: Location,
    pub to_location: Location,
    pub timestamp: DateTime<Utc>,
    pub external_synced: SyncState,
}

impl MovementRecord {
    /// The record written for a freshly committed move.
    pub fn committed(id: MovementId, event: &UnitMoved) -> Self {
        Self {
            id,
            tag_id: event.tag_id.clone(),
            from_location: event.from_location.clone(),
            to_location: event.to_location.clone(),
            timestamp: event.occurred_at,
            external_synced: SyncState::Pending,
        }
    }

    /// The notification describing this record's transition.
    pub fn to_event(&self) -> UnitMoved {
        UnitMoved {
            tag_id: self.tag_id.clone(),
            from_location: self.from_location.clone(),
            to_location: self.to_location.clone(),
            occurred_at: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn loc(s: &str) -> Location {
        Location::parse(s).unwrap()
    }

    fn unit_in(location: &str) -> TrackedUnit {
        TrackedUnit::new(
            TagId::new("T1"),
            loc(location),
            UnitStatus::Other("Quarantine".to_string()),
            Utc::now(),
        )
    }

    fn move_cmd(from: &str, to: &str) -> MoveUnit {
        MoveUnit {
            tag_id: TagId::new("T1"),
            from_location: from.to_string(),
            to_location: to.to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn move_from_current_location_emits_event() {
        let unit = unit_in("VegRoom");
        let cmd = move_cmd("VegRoom", "FlowerRoom");

        let event = unit.decide_move(&cmd).unwrap();
        assert_eq!(event.from_location, loc("VegRoom"));
        assert_eq!(event.to_location, loc("FlowerRoom"));
        assert_eq!(event.occurred_at, cmd.occurred_at);
        assert_eq!(event.event_type(), "unit.moved");
    }

    #[test]
    fn stale_from_location_is_a_conflict() {
        let unit = unit_in("FlowerRoom");
        let err = unit.decide_move(&move_cmd("VegRoom", "DryRoom")).unwrap_err();
        match err {
            DomainError::Conflict(msg) if msg.contains("FlowerRoom") => {}
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn conflict_is_checked_before_destination() {
        let unit = unit_in("FlowerRoom");
        let err = unit.decide_move(&move_cmd("VegRoom", "")).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn malformed_destination_is_rejected() {
        let unit = unit_in("VegRoom");
        let err = unit.decide_move(&move_cmd("VegRoom", "  ")).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn apply_sets_location_status_and_timestamp() {
        let mut unit = unit_in("VegRoom");
        let event = unit.decide_move(&move_cmd("VegRoom", "FlowerRoom")).unwrap();
        unit.apply(&event);

        assert_eq!(unit.location(), &loc("FlowerRoom"));
        assert_eq!(unit.status(), &UnitStatus::Active);
        assert_eq!(unit.last_updated(), event.occurred_at);
    }

    #[test]
    fn notification_shape_uses_timestamp_field() {
        let unit = unit_in("VegRoom");
        let event = unit.decide_move(&move_cmd("VegRoom", "FlowerRoom")).unwrap();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["tag_id"], "T1");
        assert_eq!(json["from_location"], "VegRoom");
        assert_eq!(json["to_location"], "FlowerRoom");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn sync_state_only_moves_forward() {
        assert!(SyncState::Pending.can_advance_to(SyncState::Confirmed));
        assert!(SyncState::Pending.can_advance_to(SyncState::Failed));
        assert!(SyncState::Failed.can_advance_to(SyncState::Failed));
        assert!(SyncState::Failed.can_advance_to(SyncState::Confirmed));
        assert!(!SyncState::Confirmed.can_advance_to(SyncState::Failed));
        assert!(!SyncState::Failed.can_advance_to(SyncState::Pending));
        assert_eq!(SyncState::parse("failed").unwrap(), SyncState::Failed);
        assert!(SyncState::parse("done").is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(UnitStatus::parse("Active"), UnitStatus::Active);
        assert_eq!(UnitStatus::parse("Destroyed").as_str(), "Destroyed");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: after any sequence of moves (some with stale views), the
        /// unit's location equals the destination of the last accepted move,
        /// and every stale attempt is rejected as a conflict.
        #[test]
        fn location_tracks_last_accepted_move(
            steps in prop::collection::vec((0usize..4, 0usize..4, any::<bool>()), 1..40)
        ) {
            const ROOMS: [&str; 4] = ["VegRoom", "FlowerRoom", "DryRoom", "Vault"];
            let mut unit = unit_in(ROOMS[0]);
            let mut ledger: Vec<UnitMoved> = Vec::new();

            for (to_idx, stale_idx, use_current) in steps {
                let from = if use_current {
                    unit.location().as_str().to_string()
                } else {
                    ROOMS[stale_idx].to_string()
                };
                let cmd = move_cmd(&from, ROOMS[to_idx]);

                match unit.decide_move(&cmd) {
                    Ok(event) => {
                        prop_assert_eq!(event.from_location.as_str(), unit.location().as_str());
                        unit.apply(&event);
                        ledger.push(event);
                    }
                    Err(DomainError::Conflict(_)) => {
                        prop_assert_ne!(from.as_str(), unit.location().as_str());
                    }
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }

                if let Some(last) = ledger.last() {
                    prop_assert_eq!(unit.location(), &last.to_location);
                }
            }

            // Consecutive ledger entries chain: each from equals the previous to.
            for pair in ledger.windows(2) {
                prop_assert_eq!(&pair[1].from_location, &pair[0].to_location);
            }
        }
    }
}
