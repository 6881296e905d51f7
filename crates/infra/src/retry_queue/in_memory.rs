use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use tagtrail_core::MovementId;

use super::{RetryEntry, RetryQueue, RetryQueueError};

/// In-memory retry queue.
///
/// Intended for tests/dev: entries do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryRetryQueue {
    entries: RwLock<BTreeMap<MovementId, RetryEntry>>,
}

impl InMemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> RetryQueueError {
        RetryQueueError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn upsert(&self, entry: RetryEntry) -> Result<(), RetryQueueError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(entry.record_id, entry);
        Ok(())
    }

    async fn get(&self, record_id: MovementId) -> Result<Option<RetryEntry>, RetryQueueError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(&record_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RetryEntry>, RetryQueueError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.values().cloned().collect())
    }

    async fn remove(&self, record_id: MovementId) -> Result<bool, RetryQueueError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        Ok(entries.remove(&record_id).is_some())
    }

    async fn len(&self) -> Result<usize, RetryQueueError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.len())
    }
}
