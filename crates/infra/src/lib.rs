//! Infrastructure layer: storage, external ledger client, reconciliation,
//! config.

pub mod config;
pub mod external_ledger;
pub mod reconcile;
pub mod retry_queue;
pub mod store;
pub mod transition_engine;
