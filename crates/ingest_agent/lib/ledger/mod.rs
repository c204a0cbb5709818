//! Per-document, per-destination version bookkeeping and delivery orchestration.

pub mod activity;
mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ledger_core::db::StoreProvider;
use ledger_core::{
    now_millis, DocumentId, DocumentIngestStatus, DocumentVersions, LedgerState, OutputKey,
    PipelineSpec, PipelineSpecWithVersions,
};
use tokio_util::sync::CancellationToken;

use crate::connections::ConnectionRegistry;
use crate::connectors::{
    ConnectorRegistry, IngestRequest, OutputConnector, RemoveRequest, RepositoryDocument,
};
use crate::delivery::{classify, run_attempt, DeliveryFault, DeliveryOutcome};
use crate::error::LedgerError;
use crate::monitoring::DeliveryMetrics;

pub use activity::{ActivityRecord, ActivitySink, TracingActivitySink};
use activity::{ACTIVITY_CHECK, ACTIVITY_COMMIT, ACTIVITY_DELETE, ACTIVITY_INGEST};
use store::StatusUpdate;

const OP_INGEST: &str = "ingest";
const OP_REMOVE: &str = "remove";
const OP_COMMIT: &str = "commit";
const OP_CHECK: &str = "check";

/// Describes one attempt for metrics, logs and the activity sink.
struct AttemptContext<'a> {
    operation: &'static str,
    activity: &'static str,
    connection_name: &'a str,
    uri: Option<&'a str>,
    bytes: u64,
}

/// Decides which documents each destination needs and records what it has.
///
/// Storage work runs on the blocking pool; no store lock or transaction is held while a
/// delivery attempt is in flight. Callers must not run two operations for the same document
/// concurrently.
pub struct IngestionLedger<P> {
    registry: Arc<ConnectionRegistry<P>>,
    connectors: Arc<ConnectorRegistry>,
    activity: Arc<dyn ActivitySink>,
    metrics: DeliveryMetrics,
    max_in_clause: usize,
}

impl<P: StoreProvider> IngestionLedger<P> {
    pub fn new(
        registry: Arc<ConnectionRegistry<P>>,
        connectors: Arc<ConnectorRegistry>,
        max_in_clause: usize,
    ) -> Self {
        Self {
            registry,
            connectors,
            activity: Arc::new(TracingActivitySink),
            metrics: DeliveryMetrics::default(),
            max_in_clause: max_in_clause.max(1),
        }
    }

    pub fn with_activity_sink(mut self, activity: Arc<dyn ActivitySink>) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_metrics(mut self, metrics: DeliveryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// True when any output of the pipeline lacks a delivered copy of these versions.
    pub fn check_fetch_document(
        &self,
        pipeline: &PipelineSpecWithVersions,
        versions: &DocumentVersions,
    ) -> bool {
        pipeline.needs_fetch(versions)
    }

    /// Stored rows for every (document, output) pair of `spec`, keyed by output key.
    pub async fn get_pipeline_document_ingest_data_multiple(
        &self,
        spec: &PipelineSpec,
        documents: &[DocumentId],
    ) -> Result<HashMap<OutputKey, DocumentIngestStatus>, LedgerError> {
        let keys = output_keys(spec, documents);
        let statuses = self.load_statuses(keys).await?;
        Ok(statuses
            .into_iter()
            .map(|status| (status.key.clone(), status))
            .collect())
    }

    /// `spec` paired with this document's stored row at each output.
    pub async fn get_pipeline_document_ingest_data(
        &self,
        spec: &PipelineSpec,
        document: &DocumentId,
    ) -> Result<PipelineSpecWithVersions, LedgerError> {
        let mut stored = self
            .get_pipeline_document_ingest_data_multiple(spec, std::slice::from_ref(document))
            .await?;
        Ok(PipelineSpecWithVersions::new(spec.clone(), |connection| {
            stored.remove(&document.output_key(connection))
        }))
    }

    /// Records versions without delivering. A copy already at a destination is removed first
    /// so the destination never holds a document the ledger considers undelivered.
    pub async fn document_record(
        &self,
        spec: &PipelineSpec,
        document: &DocumentId,
        versions: &DocumentVersions,
        cancel: &CancellationToken,
    ) -> Result<(), LedgerError> {
        let stored = self
            .get_pipeline_document_ingest_data_multiple(spec, std::slice::from_ref(document))
            .await?;

        for (index, stage) in spec.output_stages() {
            let key = document.output_key(&stage.connection_name);
            if let Some(prior_uri) = stored.get(&key).and_then(|s| s.document_uri.clone()) {
                let connector = self.connector(&stage.connection_name).await?;
                self.remove_copy(&connector, &stage.connection_name, &prior_uri, &stage.version, cancel)
                    .await?;
            }

            let transformation_version = spec.packed_transformation_version(index);
            self.write_status(StatusUpdate {
                key: &key,
                state: LedgerState::Recorded,
                versions,
                transformation_version: &transformation_version,
                output_version: &stage.version,
                document_uri: None,
            })
            .await?;
        }
        Ok(())
    }

    /// Delivers the document to every output whose stored versions differ.
    ///
    /// Returns `Ok(false)` when a destination permanently rejected the document, now or on an
    /// earlier attempt at these versions; the rejection is recorded so it is not retried. Retryable, fatal and interrupted outcomes are errors.
    pub async fn document_ingest(
        &self,
        pipeline: &PipelineSpecWithVersions,
        document: &DocumentId,
        versions: &DocumentVersions,
        document_uri: &str,
        content: Arc<RepositoryDocument>,
        cancel: &CancellationToken,
    ) -> Result<bool, LedgerError> {
        let spec = pipeline.spec();
        let mut accepted = true;

        for (index, stage) in spec.output_stages() {
            if !pipeline.output_needs_delivery(index, versions) {
                if pipeline
                    .stored_status(index)
                    .is_some_and(|status| status.state == LedgerState::PermanentlyRejected)
                {
                    accepted = false;
                }
                continue;
            }
            let connection_name = stage.connection_name.as_str();
            let key = document.output_key(connection_name);
            let connector = self.connector(connection_name).await?;

            let prior_uri = pipeline
                .stored_status(index)
                .and_then(|status| status.document_uri.clone());
            if let Some(old_uri) = prior_uri.as_deref().filter(|uri| *uri != document_uri) {
                self.remove_copy(&connector, connection_name, old_uri, &stage.version, cancel)
                    .await?;
            }

            let request = IngestRequest {
                document_uri: document_uri.to_string(),
                output_version: stage.version.clone(),
                authority_name: versions.authority_name.clone(),
                document: Arc::clone(&content),
            };
            let context = AttemptContext {
                operation: OP_INGEST,
                activity: ACTIVITY_INGEST,
                connection_name,
                uri: Some(document_uri),
                bytes: content.byte_len(),
            };
            let (outcome, _) = self
                .attempt(context, connector.add_or_replace(request), cancel)
                .await;

            let transformation_version = spec.packed_transformation_version(index);
            let (state, recorded_uri) = match outcome {
                DeliveryOutcome::Success => {
                    self.metrics.bytes_delivered_total.inc_by(content.byte_len());
                    (LedgerState::Ingested, Some(document_uri))
                }
                DeliveryOutcome::PermanentReject { .. } => {
                    accepted = false;
                    // An older copy at the same URI is still at the destination.
                    (
                        LedgerState::PermanentlyRejected,
                        prior_uri.as_deref().filter(|uri| *uri == document_uri),
                    )
                }
                other => return Err(escalate(other)),
            };
            self.write_status(StatusUpdate {
                key: &key,
                state,
                versions,
                transformation_version: &transformation_version,
                output_version: &stage.version,
                document_uri: recorded_uri,
            })
            .await?;
        }
        Ok(accepted)
    }

    /// Notes that the documents were checked and found current. Versions are untouched.
    pub async fn document_check_multiple(
        &self,
        spec: &PipelineSpec,
        documents: &[DocumentId],
    ) -> Result<usize, LedgerError> {
        let now_ms = now_millis();
        let mut touched = 0;
        for chunk in output_keys(spec, documents).chunks(self.max_in_clause) {
            let chunk = chunk.to_vec();
            touched += self
                .with_store(move |conn| store::touch_check_time(conn, &chunk, now_ms))
                .await?;
        }
        Ok(touched)
    }

    pub async fn document_check(
        &self,
        spec: &PipelineSpec,
        document: &DocumentId,
    ) -> Result<usize, LedgerError> {
        self.document_check_multiple(spec, std::slice::from_ref(document))
            .await
    }

    /// Removes the documents from every output and forgets them.
    ///
    /// A permanently rejected removal still deletes the row: nothing more can be done at the
    /// destination. Any other failed removal stops the operation; rows whose copies were
    /// already handled are deleted before the error is returned, the failing row and the rest
    /// are kept.
    pub async fn document_delete_multiple(
        &self,
        spec: &PipelineSpec,
        documents: &[DocumentId],
        cancel: &CancellationToken,
    ) -> Result<usize, LedgerError> {
        let statuses = self.load_statuses(output_keys(spec, documents)).await?;
        let output_versions: HashMap<&str, &str> = spec
            .output_stages()
            .map(|(_, stage)| (stage.connection_name.as_str(), stage.version.as_str()))
            .collect();

        let mut connectors: HashMap<String, Arc<dyn OutputConnector>> = HashMap::new();
        let mut removable = Vec::with_capacity(statuses.len());
        let mut failure = None;
        for status in statuses {
            if let Some(uri) = status.document_uri.as_deref() {
                let connection_name = status.key.connection_name.as_str();
                let output_version = output_versions.get(connection_name).copied().unwrap_or("");
                let removed = match self.cached_connector(&mut connectors, connection_name).await {
                    Ok(connector) => {
                        self.remove_copy(&connector, connection_name, uri, output_version, cancel)
                            .await
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = removed {
                    failure = Some(err);
                    break;
                }
            }
            removable.push(status.key);
        }

        let deleted = self.delete_statuses(removable).await?;
        match failure {
            Some(err) => Err(err),
            None => Ok(deleted),
        }
    }

    pub async fn document_delete(
        &self,
        spec: &PipelineSpec,
        document: &DocumentId,
        cancel: &CancellationToken,
    ) -> Result<usize, LedgerError> {
        self.document_delete_multiple(spec, std::slice::from_ref(document), cancel)
            .await
    }

    /// Average milliseconds between distinct versions of each document at one output, in
    /// input order; 0 where fewer than two versions have been seen.
    pub async fn get_document_update_interval_multiple(
        &self,
        connection_name: &str,
        documents: &[DocumentId],
    ) -> Result<Vec<i64>, LedgerError> {
        let keys: Vec<OutputKey> = documents
            .iter()
            .map(|document| document.output_key(connection_name))
            .collect();
        let intervals: HashMap<OutputKey, i64> = self
            .load_statuses(keys.clone())
            .await?
            .into_iter()
            .map(|status| {
                let interval = status.update_interval();
                (status.key, interval)
            })
            .collect();
        Ok(keys
            .iter()
            .map(|key| intervals.get(key).copied().unwrap_or(0))
            .collect())
    }

    pub async fn get_document_update_interval(
        &self,
        connection_name: &str,
        document: &DocumentId,
    ) -> Result<i64, LedgerError> {
        let intervals = self
            .get_document_update_interval_multiple(connection_name, std::slice::from_ref(document))
            .await?;
        Ok(intervals.into_iter().next().unwrap_or(0))
    }

    /// Marks every row of the connection never-seen so all documents are redelivered.
    pub async fn reset_output_connection(&self, connection_name: &str) -> Result<usize, LedgerError> {
        let name = connection_name.to_string();
        let reset = self
            .with_store(move |conn| store::reset_connection(conn, &name))
            .await?;
        tracing::info!(
            event = "output_connection_reset",
            connection = connection_name,
            rows = reset,
            "reset ingestion ledger for output connection"
        );
        Ok(reset)
    }

    /// Forgets every row of a connection that is being decommissioned.
    pub async fn remove_output_connection(&self, connection_name: &str) -> Result<usize, LedgerError> {
        let name = connection_name.to_string();
        let removed = self
            .with_store(move |conn| store::remove_connection(conn, &name))
            .await?;
        self.metrics.ledger_rows_deleted_total.inc_by(removed as u64);
        tracing::info!(
            event = "output_connection_removed",
            connection = connection_name,
            rows = removed,
            "removed ingestion ledger rows for output connection"
        );
        Ok(removed)
    }

    /// Asks every output of the finished job to commit.
    pub async fn note_job_complete(
        &self,
        spec: &PipelineSpec,
        cancel: &CancellationToken,
    ) -> Result<(), LedgerError> {
        for (_, stage) in spec.output_stages() {
            let connector = self.connector(&stage.connection_name).await?;
            let context = AttemptContext {
                operation: OP_COMMIT,
                activity: ACTIVITY_COMMIT,
                connection_name: &stage.connection_name,
                uri: None,
                bytes: 0,
            };
            match self.attempt(context, connector.commit(), cancel).await {
                (DeliveryOutcome::Success, _) => {}
                (other, _) => return Err(escalate(other)),
            }
        }
        Ok(())
    }

    /// Runs the destination's status check and returns its message.
    pub async fn check_output_connection(
        &self,
        connection_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LedgerError> {
        let connector = self.connector(connection_name).await?;
        let context = AttemptContext {
            operation: OP_CHECK,
            activity: ACTIVITY_CHECK,
            connection_name,
            uri: None,
            bytes: 0,
        };
        match self.attempt(context, connector.check(), cancel).await {
            (DeliveryOutcome::Success, Some(message)) => Ok(message),
            (DeliveryOutcome::Success, None) => Ok(String::new()),
            (other, _) => Err(escalate(other)),
        }
    }

    async fn cached_connector(
        &self,
        cache: &mut HashMap<String, Arc<dyn OutputConnector>>,
        connection_name: &str,
    ) -> Result<Arc<dyn OutputConnector>, LedgerError> {
        if let Some(connector) = cache.get(connection_name) {
            return Ok(Arc::clone(connector));
        }
        let connector = self.connector(connection_name).await?;
        cache.insert(connection_name.to_string(), Arc::clone(&connector));
        Ok(connector)
    }

    async fn delete_statuses(&self, keys: Vec<OutputKey>) -> Result<usize, LedgerError> {
        let mut deleted = 0;
        for chunk in keys.chunks(self.max_in_clause) {
            let chunk = chunk.to_vec();
            let removed = self
                .with_store(move |conn| store::delete_statuses(conn, &chunk))
                .await?;
            self.metrics.ledger_rows_deleted_total.inc_by(removed as u64);
            deleted += removed;
        }
        Ok(deleted)
    }

    async fn remove_copy(
        &self,
        connector: &Arc<dyn OutputConnector>,
        connection_name: &str,
        uri: &str,
        output_version: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LedgerError> {
        let request = RemoveRequest {
            document_uri: uri.to_string(),
            output_version: output_version.to_string(),
        };
        let context = AttemptContext {
            operation: OP_REMOVE,
            activity: ACTIVITY_DELETE,
            connection_name,
            uri: Some(uri),
            bytes: 0,
        };
        match self.attempt(context, connector.remove(request), cancel).await {
            (DeliveryOutcome::Success, _) => Ok(()),
            (DeliveryOutcome::PermanentReject { reason }, _) => {
                tracing::warn!(
                    event = "document_removal_rejected",
                    connection = connection_name,
                    uri,
                    reason = %reason,
                    "destination rejected removal; forgetting the document anyway"
                );
                Ok(())
            }
            (other, _) => Err(escalate(other)),
        }
    }

    async fn attempt<T, F>(
        &self,
        context: AttemptContext<'_>,
        attempt: F,
        cancel: &CancellationToken,
    ) -> (DeliveryOutcome, Option<T>)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, DeliveryFault>> + Send + 'static,
    {
        let started_at = now_millis();
        let (result, value) = match run_attempt(attempt, cancel).await {
            Ok(value) => (Ok(()), Some(value)),
            Err(fault) => (Err(fault), None),
        };
        let outcome = classify(&result, now_millis());
        let fault = result.as_ref().err();
        self.metrics.record_attempt(context.operation, outcome.label());
        log_outcome(&context, &outcome, fault);

        self.activity.record_activity(ActivityRecord {
            started_at,
            activity: context.activity,
            connection_name: context.connection_name.to_string(),
            entity_uri: context.uri.map(str::to_string),
            result_code: outcome.result_code(fault),
            bytes: if outcome == DeliveryOutcome::Success {
                context.bytes
            } else {
                0
            },
            details: fault.map(ToString::to_string),
        });
        (outcome, value)
    }

    async fn connector(&self, connection_name: &str) -> Result<Arc<dyn OutputConnector>, LedgerError> {
        let name = connection_name.to_string();
        let registry = Arc::clone(&self.registry);
        let definition = tokio::task::spawn_blocking(move || registry.require(&name)).await??;
        self.connectors.instantiate(&definition)
    }

    async fn write_status(&self, update: StatusUpdate<'_>) -> Result<DocumentIngestStatus, LedgerError> {
        let key = update.key.clone();
        let versions = update.versions.clone();
        let transformation_version = update.transformation_version.to_string();
        let output_version = update.output_version.to_string();
        let document_uri = update.document_uri.map(str::to_string);
        let state = update.state;
        let now_ms = now_millis();

        let status = self
            .with_store(move |conn| {
                store::replace_status(
                    conn,
                    &StatusUpdate {
                        key: &key,
                        state,
                        versions: &versions,
                        transformation_version: &transformation_version,
                        output_version: &output_version,
                        document_uri: document_uri.as_deref(),
                    },
                    now_ms,
                )
            })
            .await?;
        self.metrics.ledger_rows_written_total.inc();
        tracing::debug!(
            event = "ledger_row_written",
            connection = %status.key.connection_name,
            identifier_hash = %status.key.identifier_hash,
            status = status.state.as_db_str(),
            change_count = status.change_count,
            "wrote ingestion ledger row"
        );
        Ok(status)
    }

    async fn load_statuses(&self, keys: Vec<OutputKey>) -> Result<Vec<DocumentIngestStatus>, LedgerError> {
        let mut statuses = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.max_in_clause) {
            let chunk = chunk.to_vec();
            statuses.extend(
                self.with_store(move |conn| store::load_statuses(conn, &chunk))
                    .await?,
            );
        }
        Ok(statuses)
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut P::Conn) -> Result<T, LedgerError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.store().with_conn(op)).await?
    }
}

fn output_keys(spec: &PipelineSpec, documents: &[DocumentId]) -> Vec<OutputKey> {
    documents
        .iter()
        .flat_map(|document| {
            spec.output_stages()
                .map(move |(_, stage)| document.output_key(&stage.connection_name))
        })
        .collect()
}

/// Converts an outcome that stops the operation into the caller-facing error.
fn escalate(outcome: DeliveryOutcome) -> LedgerError {
    match outcome {
        DeliveryOutcome::Retry(window) => LedgerError::TransientDelivery(window),
        DeliveryOutcome::PermanentReject { reason } => LedgerError::PermanentContent(reason),
        DeliveryOutcome::Fatal { reason } => LedgerError::Unclassified(reason),
        DeliveryOutcome::Interrupted => LedgerError::Interrupted,
        DeliveryOutcome::Success => {
            LedgerError::Unclassified("successful delivery escalated as a failure".to_string())
        }
    }
}

fn log_outcome(context: &AttemptContext<'_>, outcome: &DeliveryOutcome, fault: Option<&DeliveryFault>) {
    let uri = context.uri.unwrap_or("");
    match outcome {
        DeliveryOutcome::Success => {}
        DeliveryOutcome::Interrupted => tracing::debug!(
            event = "delivery_interrupted",
            operation = context.operation,
            connection = context.connection_name,
            uri,
            "delivery attempt interrupted"
        ),
        DeliveryOutcome::PermanentReject { reason } => tracing::warn!(
            event = "delivery_rejected",
            operation = context.operation,
            connection = context.connection_name,
            uri,
            reason = %reason,
            "destination permanently rejected document"
        ),
        DeliveryOutcome::Retry(window) => tracing::warn!(
            event = "delivery_retry_scheduled",
            operation = context.operation,
            connection = context.connection_name,
            uri,
            next_attempt_at = window.next_attempt_at,
            give_up_at = ?window.give_up_at,
            max_attempts = ?window.max_attempts,
            on_exhausted = ?window.on_exhausted,
            reason = %window.reason,
            "delivery failed; retry scheduled"
        ),
        DeliveryOutcome::Fatal { reason } => tracing::error!(
            event = "delivery_fatal",
            operation = context.operation,
            connection = context.connection_name,
            uri,
            reason = %reason,
            fault = ?fault,
            "unclassified delivery failure"
        ),
    }
}
