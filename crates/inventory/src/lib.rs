//! Tracked-unit domain module.
//!
//! This crate contains the business rules for moving tagged units between
//! locations, implemented purely as deterministic domain logic (no IO, no
//! HTTP, no storage).

pub mod unit;

pub use unit::{MoveUnit, MovementRecord, SyncState, TrackedUnit, UnitMoved, UnitStatus};
