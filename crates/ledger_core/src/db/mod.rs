pub mod migrations;
mod store;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{
    ConnectionRow, CountRow, IngestRow, NameRow, SharedConnection, StoreDb, StoreProvider,
};

/// Normalized storage failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Retryable,
    Fatal,
}

/// Typed storage failure with human-readable details.
///
/// Cloneable so one failed cache population can be reported to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == StoreErrorKind::Retryable
    }
}

impl From<DieselError> for StoreError {
    fn from(error: DieselError) -> Self {
        map_diesel_error(error)
    }
}

pub fn map_diesel_error(error: DieselError) -> StoreError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => StoreError::retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            _ => StoreError::fatal(format!(
                "fatal database error ({kind:?}): {}",
                info.message()
            )),
        },
        DieselError::RollbackTransaction => {
            StoreError::retryable("transaction rollback requested by database".to_string())
        }
        other => StoreError::fatal(format!("fatal diesel error: {other}")),
    }
}

/// Renders a SQL string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn quote_opt(value: Option<&str>) -> String {
    value.map(quote).unwrap_or_else(|| "NULL".to_string())
}

pub fn int_opt(value: Option<i64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "NULL".to_string())
}

#[cfg(test)]
mod tests {
    use diesel::result::Error as DieselError;

    use super::{map_diesel_error, quote, quote_opt, StoreErrorKind};

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("o'brien"), "'o''brien'");
        assert_eq!(quote_opt(None), "NULL");
        assert_eq!(quote_opt(Some("x")), "'x'");
    }

    #[test]
    fn rollback_is_retryable_and_not_found_is_fatal() {
        assert_eq!(
            map_diesel_error(DieselError::RollbackTransaction).kind,
            StoreErrorKind::Retryable
        );
        assert_eq!(
            map_diesel_error(DieselError::NotFound).kind,
            StoreErrorKind::Fatal
        );
    }
}
