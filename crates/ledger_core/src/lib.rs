pub mod connection;
pub mod db;
pub mod ledger;
pub mod pipeline;

pub use connection::{ConfigParams, ConnectionDefinition, DefinitionError, MAX_CONNECTION_NAME_LEN};
pub use ledger::{DocumentId, DocumentIngestStatus, DocumentVersions, LedgerState, OutputKey};
pub use pipeline::{PipelineError, PipelineSpec, PipelineSpecWithVersions, PipelineStage, StageKind};

/// Current wall-clock time as epoch milliseconds.
///
/// All persisted times (`last_record_time`, `first_ingest`, retry deadlines) use this unit.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
