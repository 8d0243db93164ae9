//! SQLite Index Store
//!
//! Persistent index with connection pooling and a `(location, ts_ms, id)`
//! index for archival scans. The table's CHECK constraint mirrors the record
//! invariant: an inline row carries a payload and no blob pointer, an archived
//! row carries a blob pointer and no payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, sqlite::SqliteRow, Pool, Row, Sqlite};
use std::time::Duration;
use tracing::{debug, info};

use super::error::StoreError;
use super::traits::{next_token, IndexStore, PageToken, ScanPage, TierCounts, UpdateOutcome};
use crate::types::{
    BlobKey, BlobPointer, Checksum, IndexEntry, Location, Metadata, RecordId, RecordSummary,
    TierKind,
};

const SELECT_COLUMNS: &str =
    "id, ts_ms, metadata, location, payload, blob_key, blob_size, blob_sha256";

/// Index store backed by SQLite
pub struct SqliteIndexStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteIndexStore {
    /// Open (or create) the index database
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `pool_size` - Maximum number of connections in the pool
    pub async fn new(db_path: &str, pool_size: u32) -> Result<Self, StoreError> {
        info!(
            "Initializing SqliteIndexStore at: {} with pool size: {}",
            db_path, pool_size
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .map_err(map_sqlx_error)?;

        let store = Self {
            pool,
            db_path: db_path.to_string(),
        };

        store.initialize_schema().await?;

        Ok(store)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY NOT NULL,
                ts_ms INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                location TEXT NOT NULL CHECK (location IN ('inline', 'archived')),
                payload BLOB,
                blob_key TEXT,
                blob_size INTEGER,
                blob_sha256 TEXT,
                CHECK (
                    (location = 'inline' AND payload IS NOT NULL AND blob_key IS NULL)
                    OR
                    (location = 'archived' AND payload IS NULL AND blob_key IS NOT NULL)
                )
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_records_location_ts ON records(location, ts_ms, id);",
            "CREATE INDEX IF NOT EXISTS idx_records_ts ON records(ts_ms, id);",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }

        info!("Index schema initialized");
        Ok(())
    }

    fn row_to_entry(row: &SqliteRow) -> Result<IndexEntry, StoreError> {
        let id: String = row.try_get("id").map_err(map_sqlx_error)?;
        let id = RecordId::parse(id).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let ts_ms: i64 = row.try_get("ts_ms").map_err(map_sqlx_error)?;
        let timestamp = DateTime::from_timestamp_millis(ts_ms)
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", ts_ms)))?;

        let metadata: String = row.try_get("metadata").map_err(map_sqlx_error)?;
        let metadata: Metadata = serde_json::from_str(&metadata)
            .map_err(|e| StoreError::Corrupt(format!("metadata for {}: {}", id, e)))?;

        let location: String = row.try_get("location").map_err(map_sqlx_error)?;
        let location = match location.parse::<TierKind>().map_err(StoreError::Corrupt)? {
            TierKind::Inline => {
                let payload: Option<Vec<u8>> = row.try_get("payload").map_err(map_sqlx_error)?;
                Location::Inline {
                    payload: payload.ok_or_else(|| {
                        StoreError::Corrupt(format!("inline record {} has no payload", id))
                    })?,
                }
            }
            TierKind::Archived => {
                let key: Option<String> = row.try_get("blob_key").map_err(map_sqlx_error)?;
                let size: Option<i64> = row.try_get("blob_size").map_err(map_sqlx_error)?;
                let sha256: Option<String> = row.try_get("blob_sha256").map_err(map_sqlx_error)?;
                match (key, size, sha256) {
                    (Some(key), Some(size), Some(sha256)) => Location::Archived {
                        blob: BlobPointer {
                            key: BlobKey::from_stored(key),
                            size: size as u64,
                            sha256: Checksum::from_hex(sha256),
                        },
                    },
                    _ => {
                        return Err(StoreError::Corrupt(format!(
                            "archived record {} has an incomplete blob pointer",
                            id
                        )))
                    }
                }
            }
        };

        Ok(IndexEntry {
            id,
            timestamp,
            metadata,
            location,
        })
    }

    fn row_to_summary(row: &SqliteRow) -> Result<RecordSummary, StoreError> {
        let id: String = row.try_get("id").map_err(map_sqlx_error)?;
        let ts_ms: i64 = row.try_get("ts_ms").map_err(map_sqlx_error)?;
        let metadata: String = row.try_get("metadata").map_err(map_sqlx_error)?;
        let location: String = row.try_get("location").map_err(map_sqlx_error)?;

        Ok(RecordSummary {
            id: RecordId::parse(id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            timestamp: DateTime::from_timestamp_millis(ts_ms)
                .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", ts_ms)))?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            tier: location.parse().map_err(StoreError::Corrupt)?,
        })
    }
}

/// Column values for an entry, split by location
struct EntryColumns {
    metadata: String,
    location: &'static str,
    payload: Option<Vec<u8>>,
    blob_key: Option<String>,
    blob_size: Option<i64>,
    blob_sha256: Option<String>,
}

impl EntryColumns {
    fn from_entry(entry: &IndexEntry) -> Result<Self, StoreError> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        Ok(match &entry.location {
            Location::Inline { payload } => Self {
                metadata,
                location: TierKind::Inline.as_str(),
                payload: Some(payload.clone()),
                blob_key: None,
                blob_size: None,
                blob_sha256: None,
            },
            Location::Archived { blob } => Self {
                metadata,
                location: TierKind::Archived.as_str(),
                payload: None,
                blob_key: Some(blob.key.as_str().to_string()),
                blob_size: Some(blob.size as i64),
                blob_sha256: Some(blob.sha256.as_str().to_string()),
            },
        })
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn get(&self, id: &RecordId) -> Result<Option<IndexEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM records WHERE id = ?", SELECT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn put(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        let columns = EntryColumns::from_entry(entry)?;

        sqlx::query(
            r#"
            INSERT INTO records (id, ts_ms, metadata, location, payload, blob_key, blob_size, blob_sha256)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.as_str())
        .bind(entry.timestamp.timestamp_millis())
        .bind(columns.metadata)
        .bind(columns.location)
        .bind(columns.payload)
        .bind(columns.blob_key)
        .bind(columns.blob_size)
        .bind(columns.blob_sha256)
        .execute(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            StoreError::Backend(msg) if msg.contains("UNIQUE") => {
                StoreError::AlreadyExists(entry.id.to_string())
            }
            other => other,
        })?;

        debug!("Indexed record {} ({})", entry.id, entry.tier());
        Ok(())
    }

    async fn conditional_update(
        &self,
        id: &RecordId,
        expected: TierKind,
        new_entry: &IndexEntry,
    ) -> Result<UpdateOutcome, StoreError> {
        if new_entry.id != *id {
            return Err(StoreError::InvalidInput(format!(
                "conditional update for {} may not change the id",
                id
            )));
        }
        let columns = EntryColumns::from_entry(new_entry)?;

        let result = sqlx::query(
            r#"
            UPDATE records
            SET metadata = ?, location = ?, payload = ?, blob_key = ?, blob_size = ?, blob_sha256 = ?
            WHERE id = ? AND location = ? AND ts_ms = ?
            "#,
        )
        .bind(columns.metadata)
        .bind(columns.location)
        .bind(columns.payload)
        .bind(columns.blob_key)
        .bind(columns.blob_size)
        .bind(columns.blob_sha256)
        .bind(id.as_str())
        .bind(expected.as_str())
        .bind(new_entry.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(UpdateOutcome::Applied);
        }

        // Nothing matched: tell a lost race apart from a missing row
        match self.get(id).await? {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(current) if current.timestamp != new_entry.timestamp => {
                Err(StoreError::InvalidInput(format!(
                    "conditional update for {} may not change the timestamp",
                    id
                )))
            }
            Some(_) => Ok(UpdateOutcome::ConditionFailed),
        }
    }

    async fn scan_archivable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = match after {
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM records WHERE location = 'inline' AND ts_ms < ? \
                     ORDER BY ts_ms, id LIMIT ?",
                    SELECT_COLUMNS
                ))
                .bind(cutoff_ms)
                .bind(limit_i64)
                .fetch_all(&self.pool)
                .await
            }
            Some(token) => {
                sqlx::query(&format!(
                    "SELECT {} FROM records WHERE location = 'inline' AND ts_ms < ? \
                     AND (ts_ms > ? OR (ts_ms = ? AND id > ?)) \
                     ORDER BY ts_ms, id LIMIT ?",
                    SELECT_COLUMNS
                ))
                .bind(cutoff_ms)
                .bind(token.after_timestamp_ms)
                .bind(token.after_timestamp_ms)
                .bind(token.after_id.as_str())
                .bind(limit_i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        let entries = rows
            .iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        let next = next_token(&entries, limit);

        Ok(ScanPage { entries, next })
    }

    async fn list_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, ts_ms, metadata, location FROM records \
             WHERE ts_ms >= ? AND ts_ms < ? ORDER BY ts_ms, id LIMIT ?",
        )
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(Self::row_to_summary).collect()
    }

    async fn tier_counts(&self) -> Result<TierCounts, StoreError> {
        let rows = sqlx::query("SELECT location, COUNT(*) AS n FROM records GROUP BY location")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut counts = TierCounts::default();
        for row in rows {
            let location: String = row.try_get("location").map_err(map_sqlx_error)?;
            let n: i64 = row.try_get("n").map_err(map_sqlx_error)?;
            match location.parse::<TierKind>().map_err(StoreError::Corrupt)? {
                TierKind::Inline => counts.inline = n as u64,
                TierKind::Archived => counts.archived = n as u64,
            }
        }
        Ok(counts)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Classify sqlx failures for the retry helper
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Io(io) => StoreError::from(io),
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            // SQLITE_BUSY / SQLITE_LOCKED clear up on their own
            if message.contains("database is locked") || message.contains("database table is locked")
            {
                StoreError::Unavailable(message)
            } else {
                StoreError::Backend(message)
            }
        }
        other => StoreError::Backend(other.to_string()),
    }
}
