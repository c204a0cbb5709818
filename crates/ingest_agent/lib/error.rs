use ledger_core::db::StoreError;
use ledger_core::ledger::UnknownLedgerState;
use ledger_core::{DefinitionError, PipelineError};
use thiserror::Error;

use crate::delivery::RetryWindow;

/// Error taxonomy surfaced by the registry and the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed definition or bad install state; fatal to the operation only.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no such connection: '{0}'")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller cancelled the operation. Not a failure and not a retry.
    #[error("operation interrupted")]
    Interrupted,
    #[error("transient delivery fault ({0})")]
    TransientDelivery(RetryWindow),
    #[error("permanent content fault: {0}")]
    PermanentContent(String),
    /// Meaning unknown; the enclosing job should abort.
    #[error("unclassified fault: {0}")]
    Unclassified(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking store task failed: {0}")]
    Task(String),
}

impl LedgerError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl From<diesel::result::Error> for LedgerError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl From<DefinitionError> for LedgerError {
    fn from(err: DefinitionError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<PipelineError> for LedgerError {
    fn from(err: PipelineError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<UnknownLedgerState> for LedgerError {
    fn from(err: UnknownLedgerState) -> Self {
        Self::Store(StoreError::fatal(err.to_string()))
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
