//! SQLite catalog file.
//!
//! A single database holds both providers' character, taxonomy and tag-link
//! tables (see `migrations/`). Opening it applies the embedded migrations, so
//! a [`Database`] handle always points at the current schema.
//!
//! File catalogs run in WAL mode: the read API keeps serving pages while an
//! ingestion run is upserting, and writers wait out each other's locks for
//! [`BUSY_TIMEOUT`] before a store call reports busy.
//!
//! ```no_run
//! use cardex_core::{CharacterStore, Database};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = CharacterStore::new(Database::new(Path::new("cardex.db")).await?);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for a file catalog. SQLite serializes writers, so more
/// connections only help concurrent readers.
const FILE_POOL_SIZE: u32 = 5;

/// How long a connection waits on another writer's lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure to open the catalog.
#[derive(Error, Debug)]
pub enum DbError {
    /// The file could not be created or opened.
    #[error("failed to open catalog at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    /// The schema could not be brought up to date.
    #[error("failed to migrate catalog schema: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Open catalog with its schema applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if missing) the catalog file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the file cannot be opened and
    /// [`DbError::Migrate`] if a migration fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn new(path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: path.display().to_string(),
                source,
            })?;

        Self::migrated(pool).await
    }

    /// Opens a private in-memory catalog.
    ///
    /// The catalog lives exactly as long as the pool's one connection, which
    /// is never idled out or recycled.
    ///
    /// # Errors
    ///
    /// Same as [`Database::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: ":memory:".to_string(),
                source,
            })?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("catalog schema up to date");
        Ok(Self { pool })
    }

    /// Connection pool the store runs its queries on.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for in-flight queries, then closes every connection.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PROVIDER_TABLES: [&str; 6] = [
        "chub_characters",
        "chub_tags",
        "chub_character_tags",
        "janitor_characters",
        "janitor_tags",
        "janitor_character_tags",
    ];

    async fn insert_janitor_character(db: &Database, id: &str) {
        sqlx::query(
            "INSERT INTO janitor_characters (id, created_at, updated_at) \
             VALUES (?, '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
        )
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_new_catalog_has_empty_provider_tables() {
        let db = Database::new_in_memory().await.unwrap();

        for table in PROVIDER_TABLES {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} should exist and be empty");
        }
    }

    #[tokio::test]
    async fn test_tag_link_requires_taxonomy_entry() {
        let db = Database::new_in_memory().await.unwrap();
        insert_janitor_character(&db, "x").await;

        let unknown = sqlx::query(
            "INSERT INTO janitor_character_tags (character_id, tag) VALUES ('x', 'Unknown')",
        )
        .execute(db.pool())
        .await;
        assert!(unknown.is_err(), "links must reference a known tag");

        sqlx::query("INSERT INTO janitor_tags (name) VALUES ('Known')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO janitor_character_tags (character_id, tag) VALUES ('x', 'Known')")
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hard_delete_cascades_to_tag_links() {
        let db = Database::new_in_memory().await.unwrap();
        insert_janitor_character(&db, "x").await;
        sqlx::query("INSERT INTO janitor_tags (name) VALUES ('Drama')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO janitor_character_tags (character_id, tag) VALUES ('x', 'Drama')")
            .execute(db.pool())
            .await
            .unwrap();

        sqlx::query("DELETE FROM janitor_characters WHERE id = 'x'")
            .execute(db.pool())
            .await
            .unwrap();

        let (links,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM janitor_character_tags")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(links, 0);
    }

    #[tokio::test]
    async fn test_file_catalog_uses_wal_and_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("catalog.db");

        let db = Database::new(&path).await.unwrap();
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"), "journal mode was {mode}");
        insert_janitor_character(&db, "kept").await;
        db.close().await;

        let reopened = Database::new(&path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM janitor_characters")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(count, 1, "migrations rerun without touching stored rows");
    }

    #[tokio::test]
    async fn test_open_fails_for_missing_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent").join("catalog.db");

        let error = Database::new(&path).await.unwrap_err();
        assert!(matches!(error, DbError::Open { .. }));
        assert!(error.to_string().contains("absent"), "{error}");
    }
}
