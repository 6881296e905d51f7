//! Unit Registry + Movement Ledger storage boundary.
//!
//! The registry (tag → current location/status) and the ledger (append-only
//! movement records) share one storage boundary so a move is applied to both
//! atomically.

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryUnitStore;
pub use sqlite::SqliteUnitStore;
pub use r#trait::{StoreError, UnitStore};
