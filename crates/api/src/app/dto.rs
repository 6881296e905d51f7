use serde::Deserialize;

use tagtrail_infra::retry_queue::RetryEntry;
use tagtrail_inventory::{MovementRecord, TrackedUnit, UnitMoved};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ProvisionUnitRequest {
    pub tag_id: String,
    pub location: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveUnitRequest {
    pub tag_id: String,
    pub from_location: String,
    pub to_location: String,
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn unit_to_json(unit: &TrackedUnit) -> serde_json::Value {
    serde_json::json!({
        "tag_id": unit.tag_id().as_str(),
        "location": unit.location().as_str(),
        "status": unit.status().as_str(),
        "last_updated": unit.last_updated().to_rfc3339(),
    })
}

pub fn record_to_json(record: &MovementRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id.value(),
        "tag_id": record.tag_id.as_str(),
        "from_location": record.from_location.as_str(),
        "to_location": record.to_location.as_str(),
        "timestamp": record.timestamp.to_rfc3339(),
        "external_synced": record.external_synced.as_str(),
    })
}

/// Observer payload: exactly what was committed, no sync state.
pub fn moved_to_json(moved: &UnitMoved) -> serde_json::Value {
    serde_json::json!({
        "tag_id": moved.tag_id.as_str(),
        "from_location": moved.from_location.as_str(),
        "to_location": moved.to_location.as_str(),
        "timestamp": moved.occurred_at.to_rfc3339(),
    })
}

pub fn retry_entry_to_json(entry: &RetryEntry) -> serde_json::Value {
    serde_json::json!({
        "record_id": entry.record_id.value(),
        "tag_id": entry.tag_id.as_str(),
        "destination": entry.destination.as_str(),
        "move_timestamp": entry.move_timestamp.to_rfc3339(),
        "reason": entry.reason.as_str(),
        "last_error": entry.last_error,
        "attempts": entry.attempts,
        "first_failed_at": entry.first_failed_at.to_rfc3339(),
        "last_failed_at": entry.last_failed_at.to_rfc3339(),
        "next_attempt_at": entry.next_attempt_at.to_rfc3339(),
    })
}
