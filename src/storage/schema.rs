use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::types::StorageError;

/// Path that selects an isolated in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Schema migrations, applied in order and recorded in `PRAGMA user_version`.
///
/// Migrations are additive: a step may create tables, columns and indexes but
/// never drops anything an earlier step created.
const MIGRATIONS: &[(u32, &[&str])] = &[
    (
        1,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            )
            "#,
        ],
    ),
    (
        2,
        &[
            "ALTER TABLE articles ADD COLUMN feed_id TEXT",
            "CREATE INDEX IF NOT EXISTS idx_articles_feed_id ON articles(feed_id)",
        ],
    ),
];

// ============================================================================
// Database
// ============================================================================

/// Handle to the local object store.
///
/// Constructing a `Database` does no I/O. The connection is established by
/// [`Database::open`], which is idempotent; clones share the same pool, so one
/// handle can be injected into every component of the process.
#[derive(Clone)]
pub struct Database {
    path: Arc<str>,
    pool: Arc<OnceCell<SqlitePool>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Database {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: Arc::from(path.as_ref()),
            pool: Arc::new(OnceCell::new()),
        }
    }

    /// An unopened handle to a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.pool.initialized()
    }

    /// Open the connection pool and bring the schema up to date.
    ///
    /// Safe to call repeatedly and concurrently; only the first call connects.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Unavailable`] if the parent directory of the database
    ///   file does not exist or SQLite cannot open the file.
    /// - [`StorageError::OpenFailed`] for any other connection failure.
    /// - [`StorageError::Migration`] if the schema cannot be created.
    pub async fn open(&self) -> Result<(), StorageError> {
        self.pool
            .get_or_try_init(|| connect(&self.path))
            .await?;
        Ok(())
    }

    /// Open pool, or [`StorageError::NotInitialized`] before `open()`.
    pub(crate) fn pool(&self) -> Result<&SqlitePool, StorageError> {
        self.pool.get().ok_or(StorageError::NotInitialized)
    }

    /// Schema version recorded in the database header.
    pub async fn schema_version(&self) -> Result<u32, StorageError> {
        let row: (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(self.pool()?)
            .await?;
        Ok(row.0 as u32)
    }
}

async fn connect(path: &str) -> Result<SqlitePool, StorageError> {
    let in_memory = path == IN_MEMORY;

    if !in_memory {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(StorageError::Unavailable(format!(
                    "directory '{}' does not exist",
                    parent.display()
                )));
            }
        }
    }

    let url = format!("sqlite:{}?mode=rwc", path);
    // busy_timeout=5000: concurrent refresh transactions wait for the write
    // lock instead of failing with SQLITE_BUSY.
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(StorageError::OpenFailed)?
        .pragma("busy_timeout", "5000");

    // Every connection to an in-memory store must stay alive for the
    // lifetime of the pool, otherwise the data goes with it. A single
    // connection also keeps shared-cache table locks out of the picture.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(StorageError::from_connect)?;

    let version = migrate(&pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    tracing::info!(path = %path, schema_version = version, "Opened feed store");
    Ok(pool)
}

/// Apply every migration newer than the stored `user_version` inside one
/// transaction. Returns the resulting schema version.
async fn migrate(pool: &SqlitePool) -> Result<u32, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let (current,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(&mut *tx)
        .await?;
    let mut version = current as u32;

    for (target, statements) in MIGRATIONS {
        if *target <= version {
            continue;
        }
        for statement in statements.iter() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        // PRAGMA does not accept bound parameters; the value is a constant
        sqlx::query(&format!("PRAGMA user_version = {}", target))
            .execute(&mut *tx)
            .await?;
        tracing::debug!(from = version, to = *target, "Applied storage migration");
        version = *target;
    }

    tx.commit().await?;
    Ok(version)
}
