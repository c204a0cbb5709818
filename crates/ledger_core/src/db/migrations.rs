use std::error::Error;

#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{FileBasedMigrations, MigrationError, MigrationHarness};

#[cfg(feature = "postgres")]
const POSTGRES_MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");
const SQLITE_MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sqlite_migrations");

pub type MigrationRunError = Box<dyn Error + Send + Sync>;

/// Loads the Postgres migration set that creates the connection and ledger tables.
#[cfg(feature = "postgres")]
pub fn postgres_migrations() -> Result<FileBasedMigrations, MigrationError> {
    FileBasedMigrations::from_path(POSTGRES_MIGRATIONS_DIR)
}

/// Loads the SQLite migration set.
///
/// Mirrors the Postgres schema shape so SQL-heavy logic can be exercised without a live
/// Postgres instance.
pub fn sqlite_migrations() -> Result<FileBasedMigrations, MigrationError> {
    FileBasedMigrations::from_path(SQLITE_MIGRATIONS_DIR)
}

#[cfg(feature = "postgres")]
pub fn run_postgres_migrations(conn: &mut PgConnection) -> Result<(), MigrationRunError> {
    conn.run_pending_migrations(postgres_migrations()?)?;
    Ok(())
}

pub fn run_sqlite_migrations(conn: &mut SqliteConnection) -> Result<(), MigrationRunError> {
    conn.run_pending_migrations(sqlite_migrations()?)?;
    Ok(())
}
