use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for one classified delivery attempt.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AttemptLabels {
    /// `ingest`, `remove`, `commit` or `check`.
    pub operation: &'static str,
    /// `success`, `permanent_reject`, `retry`, `fatal` or `interrupted`.
    pub outcome: &'static str,
}

#[derive(Clone, Default)]
pub struct DeliveryMetrics {
    /// Delivery attempts by operation and classified outcome.
    pub attempts_total: Family<AttemptLabels, Counter>,
    /// Ledger rows inserted or replaced.
    pub ledger_rows_written_total: Counter,
    /// Ledger rows deleted by document or connection removal.
    pub ledger_rows_deleted_total: Counter,
    /// Bytes of document content handed to destinations on successful ingests.
    pub bytes_delivered_total: Counter,
}

impl DeliveryMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "delivery_attempts",
            "Total number of delivery attempts by operation and outcome",
            metrics.attempts_total.clone(),
        );
        sub_registry.register(
            "ledger_rows_written",
            "Total number of ingestion ledger rows written",
            metrics.ledger_rows_written_total.clone(),
        );
        sub_registry.register(
            "ledger_rows_deleted",
            "Total number of ingestion ledger rows deleted",
            metrics.ledger_rows_deleted_total.clone(),
        );
        sub_registry.register(
            "bytes_delivered",
            "Total bytes of document content delivered",
            metrics.bytes_delivered_total.clone(),
        );
        metrics
    }

    pub fn record_attempt(&self, operation: &'static str, outcome: &'static str) {
        self.attempts_total
            .get_or_create(&AttemptLabels { operation, outcome })
            .inc();
    }
}
