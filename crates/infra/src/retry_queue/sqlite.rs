//! Retry queue persisted in its own SQLite database (`retry_queue` table).
//!
//! The queue lives apart from the registry/ledger database so that losing
//! either one never takes the other down with it.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use tagtrail_core::{Location, MovementId, TagId};

use super::{FailureReason, RetryEntry, RetryQueue, RetryQueueError};
use crate::store::sqlite::{format_ts, open_pool, parse_ts};

impl sqlx::Type<sqlx::Sqlite> for FailureReason {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for FailureReason {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        FailureReason::parse(s).ok_or_else(|| format!("invalid FailureReason: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for FailureReason {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// SQLite-backed retry queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteRetryQueue {
    pool: SqlitePool,
}

impl SqliteRetryQueue {
    pub async fn connect(url: &str) -> Result<Self, RetryQueueError> {
        let pool = open_pool(url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_queue (
                record_id        INTEGER PRIMARY KEY,
                tag_id           TEXT NOT NULL,
                destination      TEXT NOT NULL,
                move_timestamp   TEXT NOT NULL,
                reason           TEXT NOT NULL,
                last_error       TEXT NOT NULL,
                attempts         INTEGER NOT NULL,
                first_failed_at  TEXT NOT NULL,
                last_failed_at   TEXT NOT NULL,
                next_attempt_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<RetryEntry, RetryQueueError> {
    let record_id: i64 = row.try_get("record_id")?;
    let tag_id: String = row.try_get("tag_id")?;
    let destination: String = row.try_get("destination")?;
    let move_timestamp: String = row.try_get("move_timestamp")?;
    let attempts: i64 = row.try_get("attempts")?;
    let first_failed_at: String = row.try_get("first_failed_at")?;
    let last_failed_at: String = row.try_get("last_failed_at")?;
    let next_attempt_at: String = row.try_get("next_attempt_at")?;

    Ok(RetryEntry {
        record_id: MovementId::new(record_id as u64),
        tag_id: TagId::new(tag_id),
        destination: Location::parse(&destination).map_err(|e| RetryQueueError::Backend(e.to_string()))?,
        move_timestamp: parse_ts(&move_timestamp).map_err(RetryQueueError::Backend)?,
        reason: row.try_get("reason")?,
        last_error: row.try_get("last_error")?,
        attempts: attempts.clamp(0, u32::MAX as i64) as u32,
        first_failed_at: parse_ts(&first_failed_at).map_err(RetryQueueError::Backend)?,
        last_failed_at: parse_ts(&last_failed_at).map_err(RetryQueueError::Backend)?,
        next_attempt_at: parse_ts(&next_attempt_at).map_err(RetryQueueError::Backend)?,
    })
}

#[async_trait]
impl RetryQueue for SqliteRetryQueue {
    async fn upsert(&self, entry: RetryEntry) -> Result<(), RetryQueueError> {
        sqlx::query(
            r#"
            INSERT INTO retry_queue (
                record_id, tag_id, destination, move_timestamp, reason, last_error,
                attempts, first_failed_at, last_failed_at, next_attempt_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (record_id) DO UPDATE SET
                reason = excluded.reason,
                last_error = excluded.last_error,
                attempts = excluded.attempts,
                last_failed_at = excluded.last_failed_at,
                next_attempt_at = excluded.next_attempt_at
            "#,
        )
        .bind(entry.record_id.value() as i64)
        .bind(entry.tag_id.as_str())
        .bind(entry.destination.as_str())
        .bind(format_ts(entry.move_timestamp))
        .bind(entry.reason)
        .bind(&entry.last_error)
        .bind(entry.attempts as i64)
        .bind(format_ts(entry.first_failed_at))
        .bind(format_ts(entry.last_failed_at))
        .bind(format_ts(entry.next_attempt_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, record_id: MovementId) -> Result<Option<RetryEntry>, RetryQueueError> {
        let row = sqlx::query("SELECT * FROM retry_queue WHERE record_id = ?")
            .bind(record_id.value() as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list(&self) -> Result<Vec<RetryEntry>, RetryQueueError> {
        let rows = sqlx::query("SELECT * FROM retry_queue ORDER BY record_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn remove(&self, record_id: MovementId) -> Result<bool, RetryQueueError> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE record_id = ?")
            .bind(record_id.value() as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn len(&self) -> Result<usize, RetryQueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound, Utc};
    use tagtrail_inventory::{MovementRecord, UnitMoved};

    use super::*;

    fn record(id: u64) -> MovementRecord {
        let event = UnitMoved {
            tag_id: TagId::new("T1"),
            from_location: Location::parse("VegRoom").unwrap(),
            to_location: Location::parse("FlowerRoom").unwrap(),
            occurred_at: Utc::now().trunc_subsecs(6),
        };
        MovementRecord::committed(MovementId::new(id), &event)
    }

    async fn open(dir: &tempfile::TempDir) -> SqliteRetryQueue {
        let url = format!("sqlite://{}", dir.path().join("retry.db").display());
        SqliteRetryQueue::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn entries_survive_reopen_in_record_order() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now().trunc_subsecs(6);

        {
            let queue = open(&dir).await;
            for id in [5, 2, 9] {
                let entry = RetryEntry::new(&record(id), FailureReason::Transient, "timeout", now, now);
                queue.upsert(entry).await.unwrap();
            }
            queue.pool().close().await;
        }

        let queue = open(&dir).await;
        let ids: Vec<u64> = queue
            .list()
            .await
            .unwrap()
            .iter()
            .map(|e| e.record_id.value())
            .collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(queue.len().await.unwrap(), 3);

        let entry = queue.get(MovementId::new(5)).await.unwrap().unwrap();
        assert_eq!(entry.destination.as_str(), "FlowerRoom");
        assert_eq!(entry.reason, FailureReason::Transient);
        assert_eq!(entry.first_failed_at, now);
    }

    #[tokio::test]
    async fn upsert_updates_attempt_state_but_keeps_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir).await;
        let first = Utc::now().trunc_subsecs(6);
        let later = first + Duration::seconds(30);

        let mut entry = RetryEntry::new(&record(1), FailureReason::Deferred, "blocked", first, first);
        queue.upsert(entry.clone()).await.unwrap();

        entry.record_attempt(FailureReason::Rejected, "HTTP 400", later, later);
        entry.first_failed_at = later;
        queue.upsert(entry).await.unwrap();

        let stored = queue.get(MovementId::new(1)).await.unwrap().unwrap();
        assert_eq!(stored.reason, FailureReason::Rejected);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error, "HTTP 400");
        assert_eq!(stored.first_failed_at, first);
        assert_eq!(stored.last_failed_at, later);
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir).await;
        let now = Utc::now();
        queue
            .upsert(RetryEntry::new(&record(1), FailureReason::Transient, "x", now, now))
            .await
            .unwrap();

        assert!(queue.remove(MovementId::new(1)).await.unwrap());
        assert!(!queue.remove(MovementId::new(1)).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
