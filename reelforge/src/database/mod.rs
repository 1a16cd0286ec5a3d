//! SQLite persistence.
//!
//! Connection pool management, embedded migrations, row models and the
//! sqlx-backed [`SqliteJobStore`].

pub mod models;
pub mod retry;
pub mod store;
pub mod time;

pub use store::SqliteJobStore;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

const FILE_POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a pool for `database_url` with WAL, a busy timeout and foreign keys.
///
/// `sqlite::memory:` databases live and die with one connection, so their
/// pool is pinned to a single connection that is never recycled.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .pragma("temp_store", "memory")
        .create_if_missing(true);

    let mut pool_options = SqlitePoolOptions::new().acquire_timeout(ACQUIRE_TIMEOUT);
    pool_options = if in_memory {
        pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(FILE_POOL_SIZE)
    };

    let pool = pool_options.connect_with(options).await?;
    info!(
        in_memory,
        max_connections = pool.options().get_max_connections(),
        "Database pool ready"
    );
    Ok(pool)
}

/// Apply the embedded `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_is_single_connection() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        assert_eq!(pool.options().get_max_connections(), 1);

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        // SQLite keeps in-memory databases out of WAL.
        assert!(mode == "memory" || mode == "wal");

        let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"accounts"));
        assert!(names.contains(&"jobs"));
    }
}
