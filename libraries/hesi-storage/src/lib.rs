//! HesiMusic Storage
//!
//! `SQLite` persistence for scanned songs.
//!
//! [`SongStore`] is the [`SongSink`](hesi_core::SongSink) the scanner writes
//! batches into. Saving is an upsert keyed by record id, so rescanning a
//! library replaces rows instead of duplicating them.
//!
//! # Example
//!
//! ```rust,no_run
//! use hesi_storage::{create_pool, run_migrations, SongStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = create_pool("sqlite://hesi.db").await?;
//! run_migrations(&pool).await?;
//!
//! let store = SongStore::new(pool);
//! println!("{} songs", store.count().await?);
//! # Ok(())
//! # }
//! ```

mod error;
pub mod songs;

pub use error::{Result, StorageError};
pub use songs::SongStore;

use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePool;
use tracing::debug;

// Embed migrations into binary
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Bring the schema up to date
///
/// # Errors
///
/// Returns an error if migrations fail to run
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Create a new `SQLite` pool
///
/// # Arguments
///
/// * `database_url` - `SQLite` connection string (e.g., `<sqlite://hesi.db>`)
///
/// # Errors
///
/// Returns an error if the connection fails
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;

    debug!("Creating pool with URL: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
