use std::sync::Arc;

use ledger_core::db::StoreProvider;
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::connections::{ConnectionRegistry, RegistryCollaborators, RegistryOptions};
use crate::connectors::ConnectorRegistry;
use crate::ledger::IngestionLedger;
use crate::monitoring::DeliveryMetrics;

const METRICS_PREFIX: &str = "ingest_agent";

/// Everything one agent process shares: built once at startup, torn down at exit.
pub struct AgentContext<P> {
    pub registry: Arc<ConnectionRegistry<P>>,
    pub connectors: Arc<ConnectorRegistry>,
    pub ledger: Arc<IngestionLedger<P>>,
    pub metrics: RwLock<Registry>,
    pub shutdown_token: CancellationToken,
}

impl<P: StoreProvider> AgentContext<P> {
    pub fn start(
        store: P,
        connectors: Arc<ConnectorRegistry>,
        collaborators: RegistryCollaborators,
        options: RegistryOptions,
    ) -> Self {
        let mut metrics = Registry::default();
        let delivery_metrics = DeliveryMetrics::register(&mut metrics, METRICS_PREFIX);

        let registry = Arc::new(ConnectionRegistry::new(store, collaborators, options));
        let ledger = IngestionLedger::new(
            Arc::clone(&registry),
            Arc::clone(&connectors),
            options.max_in_clause,
        )
        .with_metrics(delivery_metrics);

        tracing::info!(
            event = "agent_context_started",
            connectors = connectors.installed().len(),
            max_in_clause = options.max_in_clause,
            "started ingest agent context"
        );

        Self {
            registry,
            connectors,
            ledger: Arc::new(ledger),
            metrics: RwLock::new(metrics),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Cancels in-flight attempts and drops process-wide caches.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.registry.clear_cache();
        self.connectors.shutdown();
        tracing::info!(event = "agent_context_shutdown", "shut down ingest agent context");
    }
}
