//! Song rows
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use hesi_core::{SongRecord, SongSink};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

const UPSERT: &str = r"
    INSERT INTO songs (
        id, path, cue_blob, title, artist, album, duration_ms, size_bytes,
        format, bitrate, sample_rate, channels, tags_json, fingerprint, last_scanned_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        path = excluded.path,
        cue_blob = excluded.cue_blob,
        title = excluded.title,
        artist = excluded.artist,
        album = excluded.album,
        duration_ms = excluded.duration_ms,
        size_bytes = excluded.size_bytes,
        format = excluded.format,
        bitrate = excluded.bitrate,
        sample_rate = excluded.sample_rate,
        channels = excluded.channels,
        tags_json = excluded.tags_json,
        fingerprint = excluded.fingerprint,
        last_scanned_at = excluded.last_scanned_at
";

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(column: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StorageError::InvalidValue { column, value })
}

fn optional<T: TryFrom<i64>>(row: &SqliteRow, column: &'static str) -> Result<Option<T>> {
    row.try_get::<Option<i64>, _>(column)?
        .map(|value| T::try_from(value).map_err(|_| StorageError::InvalidValue { column, value }))
        .transpose()
}

fn from_row(row: &SqliteRow) -> Result<SongRecord> {
    Ok(SongRecord {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        cue_blob: row.try_get("cue_blob")?,
        title: row.try_get("title")?,
        artist: row.try_get("artist")?,
        album: row.try_get("album")?,
        duration_ms: from_db("duration_ms", row.try_get("duration_ms")?)?,
        size_bytes: from_db("size_bytes", row.try_get("size_bytes")?)?,
        format: row.try_get("format")?,
        bitrate: optional(row, "bitrate")?,
        sample_rate: optional(row, "sample_rate")?,
        channels: optional(row, "channels")?,
        tags_json: row.try_get("tags_json")?,
        fingerprint: row.try_get("fingerprint")?,
        last_scanned_at: row.try_get("last_scanned_at")?,
    })
}

/// Insert or replace every record, atomically
pub async fn upsert_batch(pool: &SqlitePool, records: &[SongRecord]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for record in records {
        sqlx::query(UPSERT)
            .bind(&record.id)
            .bind(&record.path)
            .bind(&record.cue_blob)
            .bind(&record.title)
            .bind(&record.artist)
            .bind(&record.album)
            .bind(to_db(record.duration_ms))
            .bind(to_db(record.size_bytes))
            .bind(&record.format)
            .bind(record.bitrate.map(i64::from))
            .bind(record.sample_rate.map(i64::from))
            .bind(record.channels.map(i64::from))
            .bind(&record.tags_json)
            .bind(&record.fingerprint)
            .bind(record.last_scanned_at)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    debug!("Upserted {} song(s)", records.len());
    Ok(())
}

/// Get a song by id
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<SongRecord>> {
    let row = sqlx::query("SELECT * FROM songs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(from_row).transpose()
}

/// Songs cut from (or stored for) one physical file, ordered by id
pub async fn get_by_path(pool: &SqlitePool, path: &str) -> Result<Vec<SongRecord>> {
    let rows = sqlx::query("SELECT * FROM songs WHERE path = ? ORDER BY id")
        .bind(path)
        .fetch_all(pool)
        .await?;

    rows.iter().map(from_row).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM songs")
        .fetch_one(pool)
        .await?;
    from_db("count", count)
}

/// Every stored id, sorted
pub async fn all_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT id FROM songs ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// `SQLite`-backed song store
#[derive(Debug, Clone)]
pub struct SongStore {
    pool: SqlitePool,
}

impl SongStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, id: &str) -> Result<Option<SongRecord>> {
        get(&self.pool, id).await
    }

    /// Like [`SongStore::get`], but a missing row is an error
    pub async fn require(&self, id: &str) -> Result<SongRecord> {
        self.get(id)
            .await?
            .ok_or_else(|| StorageError::not_found("song", id))
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Vec<SongRecord>> {
        get_by_path(&self.pool, path).await
    }

    pub async fn count(&self) -> Result<u64> {
        count(&self.pool).await
    }

    pub async fn all_ids(&self) -> Result<Vec<String>> {
        all_ids(&self.pool).await
    }
}

#[async_trait]
impl SongSink for SongStore {
    async fn save_batch(&self, records: &[SongRecord]) -> hesi_core::Result<()> {
        upsert_batch(&self.pool, records).await?;
        Ok(())
    }
}
