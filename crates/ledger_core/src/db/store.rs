use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::SqliteConnection;

use super::StoreError;

#[derive(Debug, QueryableByName)]
pub struct ConnectionRow {
    #[diesel(sql_type = Text)]
    pub connection_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub description: Option<String>,
    #[diesel(sql_type = Text)]
    pub class_name: String,
    #[diesel(sql_type = BigInt)]
    pub max_count: i64,
    #[diesel(sql_type = Nullable<Text>)]
    pub config_document: Option<String>,
}

#[derive(Debug, QueryableByName)]
pub struct NameRow {
    #[diesel(sql_type = Text)]
    pub connection_name: String,
}

#[derive(Debug, QueryableByName)]
pub struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub row_count: i64,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct IngestRow {
    #[diesel(sql_type = Text)]
    pub connection_name: String,
    #[diesel(sql_type = Text)]
    pub identifier_class: String,
    #[diesel(sql_type = Text)]
    pub identifier_hash: String,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub document_version: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub transformation_version: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub output_version: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub parameter_version: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub authority_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub document_uri: Option<String>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub first_ingest: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub last_ingest: Option<i64>,
    #[diesel(sql_type = BigInt)]
    pub change_count: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub last_record_time: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub last_check_time: Option<i64>,
}

/// Raw SQL executor shared by the Postgres and SQLite backends.
pub trait StoreDb {
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError>;
    fn load_connections(&mut self, sql: &str) -> Result<Vec<ConnectionRow>, DieselError>;
    fn load_names(&mut self, sql: &str) -> Result<Vec<NameRow>, DieselError>;
    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError>;
    fn load_ingest_rows(&mut self, sql: &str) -> Result<Vec<IngestRow>, DieselError>;

    /// Suffix appended to a `SELECT` that must hold the selected rows until commit.
    fn row_lock_suffix(&self) -> &'static str;

    /// Runs `op` inside a transaction that holds write locks from its first statement.
    fn write_transaction<T, E, F>(&mut self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<DieselError>;
}

#[cfg(feature = "postgres")]
impl StoreDb for PgConnection {
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        sql_query(sql).execute(self)
    }

    fn load_connections(&mut self, sql: &str) -> Result<Vec<ConnectionRow>, DieselError> {
        sql_query(sql).load::<ConnectionRow>(self)
    }

    fn load_names(&mut self, sql: &str) -> Result<Vec<NameRow>, DieselError> {
        sql_query(sql).load::<NameRow>(self)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError> {
        sql_query(sql).load::<CountRow>(self)
    }

    fn load_ingest_rows(&mut self, sql: &str) -> Result<Vec<IngestRow>, DieselError> {
        sql_query(sql).load::<IngestRow>(self)
    }

    fn row_lock_suffix(&self) -> &'static str {
        " FOR UPDATE"
    }

    fn write_transaction<T, E, F>(&mut self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<DieselError>,
    {
        self.transaction(op)
    }
}

impl StoreDb for SqliteConnection {
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        sql_query(sql).execute(self)
    }

    fn load_connections(&mut self, sql: &str) -> Result<Vec<ConnectionRow>, DieselError> {
        sql_query(sql).load::<ConnectionRow>(self)
    }

    fn load_names(&mut self, sql: &str) -> Result<Vec<NameRow>, DieselError> {
        sql_query(sql).load::<NameRow>(self)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError> {
        sql_query(sql).load::<CountRow>(self)
    }

    fn load_ingest_rows(&mut self, sql: &str) -> Result<Vec<IngestRow>, DieselError> {
        sql_query(sql).load::<IngestRow>(self)
    }

    // SQLite has no row locks; BEGIN IMMEDIATE takes the database write lock instead.
    fn row_lock_suffix(&self) -> &'static str {
        ""
    }

    fn write_transaction<T, E, F>(&mut self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<DieselError>,
    {
        self.immediate_transaction(op)
    }
}

/// Hands out a store connection for the duration of one synchronous operation.
///
/// Callers on an async runtime must invoke this from `spawn_blocking`.
pub trait StoreProvider: Send + Sync + 'static {
    type Conn: StoreDb;

    fn with_conn<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Conn) -> Result<T, E>,
        E: From<StoreError>;
}

impl<P: StoreProvider> StoreProvider for Arc<P> {
    type Conn = P::Conn;

    fn with_conn<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Conn) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.as_ref().with_conn(op)
    }
}

/// Establishes a fresh Postgres connection per operation.
#[cfg(feature = "postgres")]
#[derive(Debug, Clone)]
pub struct PgStore {
    db_url: String,
}

#[cfg(feature = "postgres")]
impl PgStore {
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
        }
    }
}

#[cfg(feature = "postgres")]
impl StoreProvider for PgStore {
    type Conn = PgConnection;

    fn with_conn<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Conn) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = PgConnection::establish(&self.db_url).map_err(|err| {
            E::from(StoreError::retryable(format!(
                "failed to connect to postgres: {err}"
            )))
        })?;
        op(&mut conn)
    }
}

/// Serializes every operation through one long-lived connection.
///
/// Used for SQLite (embedded deployments and tests). Code running inside `op` must not
/// call back into the same provider.
pub struct SharedConnection<C> {
    conn: Mutex<C>,
}

impl<C> SharedConnection<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

impl<C: StoreDb + Send + 'static> StoreProvider for SharedConnection<C> {
    type Conn = C;

    fn with_conn<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Conn) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut *guard)
    }
}
