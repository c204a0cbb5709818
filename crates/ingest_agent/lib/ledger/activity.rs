/// One delivery attempt as it should appear in an activity history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Epoch milliseconds when the attempt started.
    pub started_at: i64,
    /// `document ingest`, `document deletion`, `output commit` or `output check`.
    pub activity: &'static str,
    pub connection_name: String,
    pub entity_uri: Option<String>,
    /// `OK`, the destination status code, `REJECTED`, `RETRY`, `INTERRUPTED` or `FATAL`.
    pub result_code: String,
    pub bytes: u64,
    pub details: Option<String>,
}

pub const ACTIVITY_INGEST: &str = "document ingest";
pub const ACTIVITY_DELETE: &str = "document deletion";
pub const ACTIVITY_COMMIT: &str = "output commit";
pub const ACTIVITY_CHECK: &str = "output check";

/// Receives one record per delivery attempt.
pub trait ActivitySink: Send + Sync {
    fn record_activity(&self, record: ActivityRecord);
}

/// Writes activity records to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivitySink;

impl ActivitySink for TracingActivitySink {
    fn record_activity(&self, record: ActivityRecord) {
        tracing::info!(
            event = "delivery_activity",
            activity = record.activity,
            connection = %record.connection_name,
            uri = record.entity_uri.as_deref().unwrap_or(""),
            result = %record.result_code,
            bytes = record.bytes,
            started_at = record.started_at,
            details = record.details.as_deref().unwrap_or(""),
            "delivery activity"
        );
    }
}
