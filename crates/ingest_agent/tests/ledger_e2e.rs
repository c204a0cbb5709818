use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use diesel::sqlite::SqliteConnection;
use futures::future::BoxFuture;
use ingest_agent_lib::connections::{ConnectionRegistry, RegistryCollaborators, RegistryOptions};
use ingest_agent_lib::connectors::{
    ConnectorRegistry, IngestRequest, OutputConnector, RemoveRequest, RepositoryDocument,
};
use ingest_agent_lib::delivery::{
    DeliveryFault, ExhaustionAction, LONG_RETRY_WINDOW_MS, RETRY_INTERVAL_MS,
};
use ingest_agent_lib::error::LedgerError;
use ingest_agent_lib::ledger::{ActivityRecord, ActivitySink, IngestionLedger};
use ledger_core::db::sqlite_test::shared_in_memory_store;
use ledger_core::db::SharedConnection;
use ledger_core::{
    now_millis, ConnectionDefinition, DocumentId, DocumentVersions, LedgerState, PipelineSpec,
    PipelineStage,
};
use tokio_util::sync::CancellationToken;

type Script = Mutex<VecDeque<Result<(), DeliveryFault>>>;

#[derive(Default)]
struct ScriptedConnector {
    ingest_script: Script,
    remove_script: Script,
    ingested: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    commits: AtomicUsize,
    hang: AtomicBool,
}

impl ScriptedConnector {
    fn script_ingest(&self, result: Result<(), DeliveryFault>) {
        self.ingest_script.lock().expect("script lock").push_back(result);
    }

    fn script_remove(&self, result: Result<(), DeliveryFault>) {
        self.remove_script.lock().expect("script lock").push_back(result);
    }

    fn ingested(&self) -> Vec<String> {
        self.ingested.lock().expect("calls lock").clone()
    }

    fn removed(&self) -> Vec<String> {
        self.removed.lock().expect("calls lock").clone()
    }

    fn next(script: &Script) -> Result<(), DeliveryFault> {
        script.lock().expect("script lock").pop_front().unwrap_or(Ok(()))
    }
}

impl OutputConnector for ScriptedConnector {
    fn add_or_replace(&self, request: IngestRequest) -> BoxFuture<'static, Result<(), DeliveryFault>> {
        self.ingested
            .lock()
            .expect("calls lock")
            .push(request.document_uri);
        if self.hang.load(Ordering::SeqCst) {
            return Box::pin(futures::future::pending());
        }
        let result = Self::next(&self.ingest_script);
        Box::pin(async move { result })
    }

    fn remove(&self, request: RemoveRequest) -> BoxFuture<'static, Result<(), DeliveryFault>> {
        self.removed
            .lock()
            .expect("calls lock")
            .push(request.document_uri);
        let result = Self::next(&self.remove_script);
        Box::pin(async move { result })
    }

    fn commit(&self) -> BoxFuture<'static, Result<(), DeliveryFault>> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn check(&self) -> BoxFuture<'static, Result<String, DeliveryFault>> {
        Box::pin(async { Ok("connection working".to_string()) })
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<ActivityRecord>>,
}

impl RecordingSink {
    fn result_codes(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("sink lock")
            .iter()
            .map(|record| record.result_code.clone())
            .collect()
    }
}

impl ActivitySink for RecordingSink {
    fn record_activity(&self, record: ActivityRecord) {
        self.records.lock().expect("sink lock").push(record);
    }
}

type Store = SharedConnection<SqliteConnection>;

struct Fixture {
    ledger: IngestionLedger<Store>,
    registry: Arc<ConnectionRegistry<Store>>,
    connector: Arc<ScriptedConnector>,
    activity: Arc<RecordingSink>,
    cancel: CancellationToken,
}

fn fixture() -> Fixture {
    let connectors = Arc::new(ConnectorRegistry::new());
    let connector = Arc::new(ScriptedConnector::default());
    let shared = connector.clone();
    connectors.register(
        "solr.connector",
        Arc::new(
            move |_: &ConnectionDefinition| -> Result<Arc<dyn OutputConnector>, LedgerError> {
                let connector: Arc<dyn OutputConnector> = shared.clone();
                Ok(connector)
            },
        ),
    );

    let registry = Arc::new(ConnectionRegistry::new(
        shared_in_memory_store(),
        RegistryCollaborators::new(connectors.clone()),
        RegistryOptions::default(),
    ));
    for name in ["solr", "archive"] {
        registry
            .save(&ConnectionDefinition::new(name, "solr.connector"))
            .expect("save connection");
    }

    let activity = Arc::new(RecordingSink::default());
    let ledger = IngestionLedger::new(registry.clone(), connectors, 2)
        .with_activity_sink(activity.clone());
    Fixture {
        ledger,
        registry,
        connector,
        activity,
        cancel: CancellationToken::new(),
    }
}

fn spec() -> PipelineSpec {
    PipelineSpec::single_output("solr", "o1")
}

fn doc(hash: &str) -> DocumentId {
    DocumentId::new("web", hash)
}

fn content() -> Arc<RepositoryDocument> {
    Arc::new(RepositoryDocument::new("text/html", b"<html>hello</html>".to_vec()))
}

impl Fixture {
    async fn ingest(
        &self,
        spec: &PipelineSpec,
        document: &DocumentId,
        versions: &DocumentVersions,
        uri: &str,
    ) -> Result<bool, LedgerError> {
        let pipeline = self
            .ledger
            .get_pipeline_document_ingest_data(spec, document)
            .await?;
        self.ledger
            .document_ingest(&pipeline, document, versions, uri, content(), &self.cancel)
            .await
    }

    async fn needs_fetch(&self, spec: &PipelineSpec, document: &DocumentId, versions: &DocumentVersions) -> bool {
        let pipeline = self
            .ledger
            .get_pipeline_document_ingest_data(spec, document)
            .await
            .expect("ingest data");
        self.ledger.check_fetch_document(&pipeline, versions)
    }

    async fn stored_state(&self, document: &DocumentId) -> Option<(LedgerState, Option<String>)> {
        let stored = self
            .ledger
            .get_pipeline_document_ingest_data_multiple(&spec(), std::slice::from_ref(document))
            .await
            .expect("ingest data");
        stored
            .get(&document.output_key("solr"))
            .map(|status| (status.state, status.document_uri.clone()))
    }
}

#[tokio::test]
async fn ingested_document_needs_no_refetch_until_a_version_changes() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let d = doc("h1");

    assert!(f.needs_fetch(&spec(), &d, &versions).await);
    assert!(f.ingest(&spec(), &d, &versions, "http://site/1").await.expect("ingest"));

    assert!(!f.needs_fetch(&spec(), &d, &versions).await);
    assert!(f.needs_fetch(&spec(), &d, &DocumentVersions::new("v2", "p1", "auth")).await);
    assert!(f.needs_fetch(&PipelineSpec::single_output("solr", "o2"), &d, &versions).await);
    assert_eq!(
        f.stored_state(&d).await,
        Some((LedgerState::Ingested, Some("http://site/1".to_string())))
    );

    assert!(f.ingest(&spec(), &d, &versions, "http://site/1").await.expect("re-ingest"));
    assert_eq!(f.connector.ingested(), vec!["http://site/1".to_string()]);
    assert_eq!(f.activity.result_codes(), vec!["OK".to_string()]);
    assert_eq!(f.ledger.metrics().bytes_delivered_total.get(), 18);
}

#[tokio::test]
async fn client_error_records_permanent_rejection() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let d = doc("h1");
    f.connector
        .script_ingest(Err(DeliveryFault::status(404, "not found")));

    let accepted = f
        .ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect("rejection is not an error");
    assert!(!accepted);
    assert_eq!(
        f.stored_state(&d).await,
        Some((LedgerState::PermanentlyRejected, None))
    );
    assert!(!f.needs_fetch(&spec(), &d, &versions).await);
    assert_eq!(f.activity.result_codes(), vec!["404".to_string()]);
}

#[tokio::test]
async fn server_error_schedules_a_retry_and_records_nothing() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let d = doc("h1");
    f.connector
        .script_ingest(Err(DeliveryFault::status(503, "unavailable")));

    let before = now_millis();
    let err = f
        .ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect_err("server error escalates");
    let after = now_millis();

    let LedgerError::TransientDelivery(window) = err else {
        panic!("expected a transient delivery error, got {err:?}");
    };
    assert!(window.next_attempt_at >= before + RETRY_INTERVAL_MS);
    assert!(window.next_attempt_at <= after + RETRY_INTERVAL_MS);
    assert_eq!(
        window.give_up_at,
        Some(window.next_attempt_at - RETRY_INTERVAL_MS + LONG_RETRY_WINDOW_MS)
    );
    assert_eq!(window.max_attempts, None);
    assert_eq!(window.on_exhausted, ExhaustionAction::AbortJob);

    assert_eq!(f.stored_state(&d).await, None);
    assert!(f.needs_fetch(&spec(), &d, &versions).await);
}

#[tokio::test]
async fn cancelled_attempt_is_interrupted() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let d = doc("h1");
    f.connector.hang.store(true, Ordering::SeqCst);

    let cancel = f.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = f
        .ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect_err("cancellation interrupts");
    assert!(err.is_interrupted());
    assert_eq!(f.stored_state(&d).await, None);
    assert_eq!(f.activity.result_codes(), vec!["INTERRUPTED".to_string()]);
}

#[tokio::test]
async fn changed_uri_removes_the_old_copy_first() {
    let f = fixture();
    let d = doc("h1");
    f.ingest(&spec(), &d, &DocumentVersions::new("v1", "p1", "auth"), "http://site/old")
        .await
        .expect("first ingest");
    f.ingest(&spec(), &d, &DocumentVersions::new("v2", "p1", "auth"), "http://site/new")
        .await
        .expect("second ingest");

    assert_eq!(f.connector.removed(), vec!["http://site/old".to_string()]);
    assert_eq!(
        f.stored_state(&d).await,
        Some((LedgerState::Ingested, Some("http://site/new".to_string())))
    );
}

#[tokio::test]
async fn rejection_keeps_uri_only_when_the_old_copy_is_still_there() {
    let f = fixture();
    let d = doc("h1");
    f.ingest(&spec(), &d, &DocumentVersions::new("v1", "p1", "auth"), "http://site/1")
        .await
        .expect("first ingest");
    f.connector
        .script_ingest(Err(DeliveryFault::status(415, "unsupported media type")));

    let accepted = f
        .ingest(&spec(), &d, &DocumentVersions::new("v2", "p1", "auth"), "http://site/1")
        .await
        .expect("rejection");
    assert!(!accepted);
    assert_eq!(
        f.stored_state(&d).await,
        Some((LedgerState::PermanentlyRejected, Some("http://site/1".to_string())))
    );
}

#[tokio::test]
async fn record_removes_a_delivered_copy() {
    let f = fixture();
    let d = doc("h1");
    f.ingest(&spec(), &d, &DocumentVersions::new("v1", "p1", "auth"), "http://site/1")
        .await
        .expect("ingest");

    let recorded = DocumentVersions::new("v2", "p1", "auth");
    f.ledger
        .document_record(&spec(), &d, &recorded, &f.cancel)
        .await
        .expect("record");

    assert_eq!(f.connector.removed(), vec!["http://site/1".to_string()]);
    assert_eq!(f.stored_state(&d).await, Some((LedgerState::Recorded, None)));
    assert!(!f.needs_fetch(&spec(), &d, &recorded).await);
}

#[tokio::test]
async fn delete_removes_delivered_copies_and_forgets_rows() {
    let f = fixture();
    let delivered = doc("h1");
    let recorded = doc("h2");
    let versions = DocumentVersions::new("v1", "p1", "auth");
    f.ingest(&spec(), &delivered, &versions, "http://site/1")
        .await
        .expect("ingest");
    f.ledger
        .document_record(&spec(), &recorded, &versions, &f.cancel)
        .await
        .expect("record");

    let deleted = f
        .ledger
        .document_delete_multiple(&spec(), &[delivered.clone(), recorded.clone()], &f.cancel)
        .await
        .expect("delete");
    assert_eq!(deleted, 2);
    assert_eq!(f.connector.removed(), vec!["http://site/1".to_string()]);
    assert_eq!(f.stored_state(&delivered).await, None);
    assert_eq!(f.stored_state(&recorded).await, None);
}

#[tokio::test]
async fn delete_survives_rejected_removal_but_not_transient_failure() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let rejected = doc("h1");
    let transient = doc("h2");
    f.ingest(&spec(), &rejected, &versions, "http://site/1")
        .await
        .expect("ingest");
    f.ingest(&spec(), &transient, &versions, "http://site/2")
        .await
        .expect("ingest");

    f.connector
        .script_remove(Err(DeliveryFault::status(404, "already gone")));
    assert_eq!(
        f.ledger
            .document_delete(&spec(), &rejected, &f.cancel)
            .await
            .expect("rejected removal still forgets"),
        1
    );
    assert_eq!(f.stored_state(&rejected).await, None);

    f.connector
        .script_remove(Err(DeliveryFault::status(502, "bad gateway")));
    assert!(matches!(
        f.ledger.document_delete(&spec(), &transient, &f.cancel).await,
        Err(LedgerError::TransientDelivery(_))
    ));
    assert!(f.stored_state(&transient).await.is_some());
}

#[tokio::test]
async fn failed_bulk_delete_still_forgets_rows_already_removed() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let documents = [doc("h1"), doc("h2")];
    f.ingest(&spec(), &documents[0], &versions, "http://site/1")
        .await
        .expect("ingest");
    f.ingest(&spec(), &documents[1], &versions, "http://site/2")
        .await
        .expect("ingest");

    f.connector.script_remove(Ok(()));
    f.connector
        .script_remove(Err(DeliveryFault::status(503, "unavailable")));
    assert!(matches!(
        f.ledger
            .document_delete_multiple(&spec(), &documents, &f.cancel)
            .await,
        Err(LedgerError::TransientDelivery(_))
    ));

    let removed = f.connector.removed();
    assert_eq!(removed.len(), 2);
    let (gone, kept, kept_uri) = if removed[0] == "http://site/1" {
        (&documents[0], &documents[1], "http://site/2")
    } else {
        (&documents[1], &documents[0], "http://site/1")
    };
    assert_eq!(f.stored_state(gone).await, None);
    assert!(f.needs_fetch(&spec(), gone, &versions).await);
    assert_eq!(
        f.stored_state(kept).await,
        Some((LedgerState::Ingested, Some(kept_uri.to_string())))
    );
    assert_eq!(f.ledger.metrics().ledger_rows_deleted_total.get(), 1);
}

#[tokio::test]
async fn unchanged_rejected_document_still_reports_rejection() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let d = doc("h1");
    f.connector
        .script_ingest(Err(DeliveryFault::status(404, "not found")));
    assert!(!f
        .ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect("rejection"));

    let accepted = f
        .ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect("skipped output");
    assert!(!accepted);
    assert_eq!(f.connector.ingested().len(), 1);
    assert_eq!(
        f.stored_state(&d).await,
        Some((LedgerState::PermanentlyRejected, None))
    );
}

#[tokio::test]
async fn reset_forces_redelivery_and_remove_forgets_everything() {
    let f = fixture();
    let versions = DocumentVersions::new("v1", "p1", "auth");
    let d = doc("h1");
    f.ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect("ingest");

    assert_eq!(f.ledger.reset_output_connection("solr").await.expect("reset"), 1);
    assert!(f.needs_fetch(&spec(), &d, &versions).await);

    f.ingest(&spec(), &d, &versions, "http://site/1")
        .await
        .expect("redeliver");
    assert_eq!(f.connector.ingested().len(), 2);

    assert_eq!(f.ledger.remove_output_connection("solr").await.expect("remove"), 1);
    assert_eq!(f.stored_state(&d).await, None);
    f.registry.delete("solr").expect("connection is free to delete");
}

#[tokio::test]
async fn update_interval_averages_time_between_versions() {
    let f = fixture();
    let d = doc("h1");
    let unseen = doc("h2");
    for version in ["v1", "v2", "v3"] {
        f.ingest(&spec(), &d, &DocumentVersions::new(version, "p1", "auth"), "http://site/1")
            .await
            .expect("ingest");
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let intervals = f
        .ledger
        .get_document_update_interval_multiple("solr", &[unseen.clone(), d.clone()])
        .await
        .expect("intervals");
    assert_eq!(intervals[0], 0);
    assert!(intervals[1] >= 15, "interval was {}", intervals[1]);
    assert_eq!(
        f.ledger
            .get_document_update_interval("solr", &d)
            .await
            .expect("interval"),
        intervals[1]
    );
}

#[tokio::test]
async fn check_touches_only_the_check_time() {
    let f = fixture();
    let d = doc("h1");
    f.ingest(&spec(), &d, &DocumentVersions::new("v1", "p1", "auth"), "http://site/1")
        .await
        .expect("ingest");

    assert_eq!(f.ledger.document_check(&spec(), &d).await.expect("check"), 1);
    let stored = f
        .ledger
        .get_pipeline_document_ingest_data_multiple(&spec(), std::slice::from_ref(&d))
        .await
        .expect("ingest data");
    let status = &stored[&d.output_key("solr")];
    assert!(status.last_check_time.is_some());
    assert_eq!(status.state, LedgerState::Ingested);
    assert_eq!(status.change_count, 1);
}

#[tokio::test]
async fn multi_output_pipeline_reports_partial_rejection() {
    let f = fixture();
    let spec = PipelineSpec::new(vec![
        PipelineStage::transformation("tika", None, "t1"),
        PipelineStage::output("solr", Some(0), "o1"),
        PipelineStage::output("archive", Some(0), "a1"),
    ])
    .expect("valid pipeline");
    let d = doc("h1");
    let versions = DocumentVersions::new("v1", "p1", "auth");
    f.connector.script_ingest(Ok(()));
    f.connector
        .script_ingest(Err(DeliveryFault::status(413, "too large")));

    assert!(!f.ingest(&spec, &d, &versions, "http://site/1").await.expect("ingest"));

    let stored = f
        .ledger
        .get_pipeline_document_ingest_data_multiple(&spec, std::slice::from_ref(&d))
        .await
        .expect("ingest data");
    assert_eq!(stored[&d.output_key("solr")].state, LedgerState::Ingested);
    assert_eq!(
        stored[&d.output_key("solr")].transformation_version.as_deref(),
        Some("tika=t1")
    );
    assert_eq!(
        stored[&d.output_key("archive")].state,
        LedgerState::PermanentlyRejected
    );
    assert!(!f.needs_fetch(&spec, &d, &versions).await);
}

#[tokio::test]
async fn job_completion_commits_and_check_reports_status() {
    let f = fixture();
    f.ledger
        .note_job_complete(&spec(), &f.cancel)
        .await
        .expect("commit");
    assert_eq!(f.connector.commits.load(Ordering::SeqCst), 1);

    assert_eq!(
        f.ledger
            .check_output_connection("solr", &f.cancel)
            .await
            .expect("check"),
        "connection working"
    );
    assert!(matches!(
        f.ledger.check_output_connection("ghost", &f.cancel).await,
        Err(LedgerError::NotFound(_))
    ));
}
