//! SQLite-backed registry + ledger.
//!
//! Both tables live in one database file so a move commits in a single
//! transaction. The file runs in WAL mode with `synchronous = FULL`, so a
//! commit that returned `Ok` survives a crash.
//!
//! ## Compare-and-swap
//!
//! `commit_move` issues `UPDATE units ... WHERE tag_id = ? AND location = ?`.
//! Zero affected rows means either the unit does not exist or it is somewhere
//! else; a follow-up read inside the same transaction tells which.
//!
//! ## Row Format
//!
//! Timestamps are RFC3339 text with microsecond precision. Sync state is
//! stored as `pending` / `confirmed` / `failed`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::instrument;

use tagtrail_core::{Location, MovementId, TagId};
use tagtrail_inventory::{MovementRecord, SyncState, TrackedUnit, UnitMoved, UnitStatus};

use super::r#trait::{StoreError, UnitStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS units (
        tag_id TEXT PRIMARY KEY,
        location TEXT NOT NULL,
        status TEXT NOT NULL,
        last_updated TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS movements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_id TEXT NOT NULL REFERENCES units(tag_id),
        from_location TEXT NOT NULL,
        to_location TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        external_synced TEXT NOT NULL DEFAULT 'pending'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS movements_by_tag ON movements (tag_id, id)",
    "CREATE INDEX IF NOT EXISTS movements_by_sync ON movements (external_synced, id)",
];

/// Open (creating if needed) a SQLite pool tuned for durable commits.
pub(crate) async fn open_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

#[derive(Debug, Clone)]
pub struct SqliteUnitStore {
    pool: SqlitePool,
}

impl SqliteUnitStore {
    /// Connect to `url` (e.g. `sqlite://tagtrail.db`) and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = open_pool(url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn row_to_unit(row: &SqliteRow) -> Result<TrackedUnit, StoreError> {
    let tag_id: String = row.try_get("tag_id")?;
    let location: String = row.try_get("location")?;
    let status: String = row.try_get("status")?;
    let last_updated: String = row.try_get("last_updated")?;

    Ok(TrackedUnit::new(
        TagId::new(tag_id),
        Location::parse(&location).map_err(|e| StoreError::Backend(e.to_string()))?,
        UnitStatus::parse(&status),
        parse_ts(&last_updated).map_err(StoreError::Backend)?,
    ))
}

fn row_to_record(row: &SqliteRow) -> Result<MovementRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let tag_id: String = row.try_get("tag_id")?;
    let from: String = row.try_get("from_location")?;
    let to: String = row.try_get("to_location")?;
    let timestamp: String = row.try_get("timestamp")?;
    let synced: String = row.try_get("external_synced")?;

    let corrupt = |e: tagtrail_core::DomainError| StoreError::Backend(e.to_string());

    Ok(MovementRecord {
        id: MovementId::new(id as u64),
        tag_id: TagId::new(tag_id),
        from_location: Location::parse(&from).map_err(corrupt)?,
        to_location: Location::parse(&to).map_err(corrupt)?,
        timestamp: parse_ts(&timestamp).map_err(StoreError::Backend)?,
        external_synced: SyncState::parse(&synced).map_err(corrupt)?,
    })
}

const RECORD_COLUMNS: &str = "id, tag_id, from_location, to_location, timestamp, external_synced";

#[async_trait]
impl UnitStore for SqliteUnitStore {
    #[instrument(skip(self, unit), fields(tag_id = %unit.tag_id()), err)]
    async fn provision(&self, unit: TrackedUnit) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO units (tag_id, location, status, last_updated) VALUES (?, ?, ?, ?) \
             ON CONFLICT (tag_id) DO NOTHING",
        )
        .bind(unit.tag_id().as_str())
        .bind(unit.location().as_str())
        .bind(unit.status().as_str())
        .bind(format_ts(unit.last_updated()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(unit.tag_id().clone()));
        }
        Ok(())
    }

    async fn get_unit(&self, tag_id: &TagId) -> Result<Option<TrackedUnit>, StoreError> {
        let row = sqlx::query(
            "SELECT tag_id, location, status, last_updated FROM units WHERE tag_id = ?",
        )
        .bind(tag_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_unit).transpose()
    }

    async fn list_units(&self) -> Result<Vec<TrackedUnit>, StoreError> {
        let rows = sqlx::query(
            "SELECT tag_id, location, status, last_updated FROM units ORDER BY tag_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_unit).collect()
    }

    #[instrument(skip(self, event), fields(tag_id = %event.tag_id), err)]
    async fn commit_move(&self, event: &UnitMoved) -> Result<MovementRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ts = format_ts(event.occurred_at);

        let updated = sqlx::query(
            "UPDATE units SET location = ?, status = ?, last_updated = ? \
             WHERE tag_id = ? AND location = ?",
        )
        .bind(event.to_location.as_str())
        .bind(UnitStatus::Active.as_str())
        .bind(&ts)
        .bind(event.tag_id.as_str())
        .bind(event.from_location.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT location FROM units WHERE tag_id = ?")
                    .bind(event.tag_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            // Dropping `tx` rolls back.
            return Err(match actual {
                None => StoreError::NotFound(event.tag_id.clone()),
                Some(actual) => StoreError::Conflict {
                    tag_id: event.tag_id.clone(),
                    expected: event.from_location.clone(),
                    actual: Location::parse(&actual)
                        .map_err(|e| StoreError::Backend(e.to_string()))?,
                },
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO movements (tag_id, from_location, to_location, timestamp, external_synced) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.tag_id.as_str())
        .bind(event.from_location.as_str())
        .bind(event.to_location.as_str())
        .bind(&ts)
        .bind(SyncState::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        let id = MovementId::new(inserted.last_insert_rowid() as u64);
        tx.commit().await?;

        Ok(MovementRecord::committed(id, event))
    }

    async fn movements_for(&self, tag_id: &TagId) -> Result<Vec<MovementRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM movements WHERE tag_id = ? ORDER BY id"
        ))
        .bind(tag_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn movement(&self, id: MovementId) -> Result<Option<MovementRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM movements WHERE id = ?"))
            .bind(id.value() as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn unsynced_movements(
        &self,
        tag_id: Option<&TagId>,
    ) -> Result<Vec<MovementRecord>, StoreError> {
        let rows = match tag_id {
            Some(tag) => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM movements \
                     WHERE external_synced != 'confirmed' AND tag_id = ? ORDER BY id"
                ))
                .bind(tag.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM movements \
                     WHERE external_synced != 'confirmed' ORDER BY id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_record).collect()
    }

    async fn set_sync_state(&self, id: MovementId, next: SyncState) -> Result<bool, StoreError> {
        // Single statement; the forward-only check lives in the WHERE clause.
        let sources: Vec<&str> = [SyncState::Pending, SyncState::Failed, SyncState::Confirmed]
            .into_iter()
            .filter(|from| *from != next && from.can_advance_to(next))
            .map(|from| from.as_str())
            .collect();

        if !sources.is_empty() {
            let placeholders = vec!["?"; sources.len()].join(", ");
            let sql = format!(
                "UPDATE movements SET external_synced = ? \
                 WHERE id = ? AND external_synced IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(next.as_str()).bind(id.value() as i64);
            for from in &sources {
                query = query.bind(*from);
            }
            if query.execute(&self.pool).await?.rows_affected() == 1 {
                return Ok(true);
            }
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM movements WHERE id = ?")
            .bind(id.value() as i64)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::RecordNotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::SubsecRound;

    use super::*;

    fn loc(s: &str) -> Location {
        Location::parse(s).unwrap()
    }

    fn moved(tag: &str, from: &str, to: &str) -> UnitMoved {
        UnitMoved {
            tag_id: TagId::new(tag),
            from_location: loc(from),
            to_location: loc(to),
            occurred_at: Utc::now().trunc_subsecs(6),
        }
    }

    async fn open(dir: &tempfile::TempDir) -> SqliteUnitStore {
        let url = format!("sqlite://{}", dir.path().join("units.db").display());
        SqliteUnitStore::connect(&url).await.unwrap()
    }

    async fn provision(store: &SqliteUnitStore, tag: &str, location: &str) {
        store
            .provision(TrackedUnit::new(
                TagId::new(tag),
                loc(location),
                UnitStatus::Other("Quarantine".into()),
                Utc::now(),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_is_atomic_and_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let event = moved("T1", "VegRoom", "FlowerRoom");

        {
            let store = open(&dir).await;
            provision(&store, "T1", "VegRoom").await;
            let record = store.commit_move(&event).await.unwrap();
            assert_eq!(record.id, MovementId::new(1));
            store.pool().close().await;
        }

        let store = open(&dir).await;
        let unit = store.get_unit(&TagId::new("T1")).await.unwrap().unwrap();
        assert_eq!(unit.location(), &loc("FlowerRoom"));
        assert_eq!(unit.status(), &UnitStatus::Active);
        assert_eq!(unit.last_updated(), event.occurred_at);

        let history = store.movements_for(&TagId::new("T1")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, event.occurred_at);
        assert_eq!(history[0].external_synced, SyncState::Pending);
    }

    #[tokio::test]
    async fn conflict_and_not_found_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        provision(&store, "T1", "FlowerRoom").await;

        let err = store.commit_move(&moved("T1", "VegRoom", "DryRoom")).await.unwrap_err();
        match err {
            StoreError::Conflict { actual, .. } => assert_eq!(actual, loc("FlowerRoom")),
            other => panic!("expected conflict, got {other:?}"),
        }

        let err = store.commit_move(&moved("ghost", "A", "B")).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(TagId::new("ghost")));

        assert!(store.unsynced_movements(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn racing_commits_from_the_same_view_admit_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir).await);
        provision(&store, "T1", "VegRoom").await;

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.commit_move(&moved("T1", "VegRoom", "FlowerRoom")).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.commit_move(&moved("T1", "VegRoom", "DryRoom")).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1, "{results:?}");
        assert_eq!(store.movements_for(&TagId::new("T1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_state_is_forward_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        provision(&store, "T1", "A").await;
        let record = store.commit_move(&moved("T1", "A", "B")).await.unwrap();

        assert!(store.set_sync_state(record.id, SyncState::Failed).await.unwrap());
        assert!(!store.set_sync_state(record.id, SyncState::Pending).await.unwrap());
        assert!(store.set_sync_state(record.id, SyncState::Confirmed).await.unwrap());
        assert!(!store.set_sync_state(record.id, SyncState::Failed).await.unwrap());

        assert!(store.unsynced_movements(None).await.unwrap().is_empty());
        assert_eq!(
            store.set_sync_state(MovementId::new(99), SyncState::Confirmed).await,
            Err(StoreError::RecordNotFound(MovementId::new(99)))
        );
    }

    #[tokio::test]
    async fn sync_updates_succeed_alongside_concurrent_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir).await);
        for u in 0..8 {
            provision(&store, &format!("T{u}"), "A").await;
        }

        let tasks: Vec<_> = (0..8)
            .map(|u| {
                let store = store.clone();
                tokio::spawn(async move {
                    let tag = format!("T{u}");
                    let mut errors = Vec::new();
                    for step in 0..50 {
                        let (from, to) = if step % 2 == 0 { ("A", "B") } else { ("B", "A") };
                        match store.commit_move(&moved(&tag, from, to)).await {
                            Ok(record) => {
                                if let Err(e) =
                                    store.set_sync_state(record.id, SyncState::Confirmed).await
                                {
                                    errors.push(e);
                                }
                            }
                            Err(e) => errors.push(e),
                        }
                    }
                    errors
                })
            })
            .collect();

        for task in tasks {
            let errors = task.await.unwrap();
            assert!(errors.is_empty(), "{errors:?}");
        }
        assert!(store.unsynced_movements(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_ledger_append_rolls_back_the_registry_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        provision(&store, "T1", "VegRoom").await;

        sqlx::query("DROP TABLE movements").execute(store.pool()).await.unwrap();

        let err = store.commit_move(&moved("T1", "VegRoom", "FlowerRoom")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)), "{err:?}");

        let unit = store.get_unit(&TagId::new("T1")).await.unwrap().unwrap();
        assert_eq!(unit.location(), &loc("VegRoom"));
        assert_eq!(unit.status(), &UnitStatus::Other("Quarantine".into()));
    }

    #[tokio::test]
    async fn duplicate_provisioning_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        provision(&store, "T1", "A").await;

        let again = TrackedUnit::new(TagId::new("T1"), loc("B"), UnitStatus::Active, Utc::now());
        assert!(matches!(store.provision(again).await, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.list_units().await.unwrap().len(), 1);
    }
}
