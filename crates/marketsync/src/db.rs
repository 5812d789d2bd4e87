//! Database connection utilities.

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};

/// Configure SQLite pragmas for concurrent workers sharing one database file.
///
/// - `journal_mode=WAL` lets the queue worker read while sync runs write
/// - `busy_timeout=5000` waits on lock contention instead of failing
/// - `synchronous=NORMAL` is safe with WAL
async fn configure_sqlite(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm::{ConnectionTrait, Statement};

    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA busy_timeout=5000",
        "PRAGMA synchronous=NORMAL",
    ] {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            pragma.to_string(),
        ))
        .await?;
    }

    Ok(())
}

fn is_sqlite_file(database_url: &str) -> bool {
    database_url.starts_with("sqlite://") && !is_sqlite_memory(database_url)
}

fn is_sqlite_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite:") && database_url.contains(":memory:")
}

/// Build connection options for `database_url`.
///
/// An in-memory SQLite database exists per connection, so it is pinned to a
/// single pooled connection that is never reaped.
fn connect_options(database_url: &str) -> ConnectOptions {
    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .sqlx_logging(false)
        .acquire_timeout(Duration::from_secs(30));

    if is_sqlite_memory(database_url) {
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(24 * 60 * 60))
            .max_lifetime(Duration::from_secs(24 * 60 * 60));
    }

    options
}

/// Establish a connection to the database.
///
/// SQLite file databases get WAL mode, a 5 second busy timeout and NORMAL
/// synchronous mode.
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(connect_options(database_url)).await?;

    if is_sqlite_file(database_url) {
        configure_sqlite(&db).await?;
    }

    Ok(db)
}

/// Establish a connection to the database and run all pending migrations.
///
/// # Example
/// ```ignore
/// let db = marketsync::connect_and_migrate("sqlite::memory:").await?;
/// ```
#[cfg(feature = "migrate")]
pub async fn connect_and_migrate(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    use sea_orm_migration::MigratorTrait;

    let db = connect(database_url).await?;
    crate::migration::Migrator::up(&db, None).await?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[tokio::test]
    async fn configure_sqlite_runs_all_pragmas() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_results((0..3).map(|_| MockExecResult {
                rows_affected: 0,
                last_insert_id: 0,
            }))
            .into_connection();

        configure_sqlite(&db)
            .await
            .expect("mock sqlite pragma execs should succeed");
    }

    #[test]
    fn memory_urls_are_not_treated_as_files() {
        assert!(is_sqlite_memory("sqlite::memory:"));
        assert!(!is_sqlite_file("sqlite::memory:"));
        assert!(is_sqlite_file("sqlite:///var/lib/marketsync.db?mode=rwc"));
        assert!(!is_sqlite_file("postgres:///marketsync"));
    }

    #[tokio::test]
    async fn connect_returns_error_for_invalid_database_url() {
        let err = connect("this-is-not-a-db-url")
            .await
            .expect_err("invalid URL should error");
        assert!(!err.to_string().is_empty());
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn connect_and_migrate_creates_schema_in_memory() {
        use sea_orm::{EntityTrait, PaginatorTrait};

        let db = connect_and_migrate("sqlite::memory:").await.unwrap();
        let count = crate::entity::event_listener::Entity::find()
            .count(&db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
