//! Destination connectors and the process-wide table of installed implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use ledger_core::ConnectionDefinition;

use crate::connections::ConnectorCatalog;
use crate::delivery::DeliveryFault;
use crate::error::LedgerError;

/// Document content handed to a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryDocument {
    pub mime_type: Option<String>,
    pub content: Vec<u8>,
    pub metadata: BTreeMap<String, Vec<String>>,
}

impl RepositoryDocument {
    pub fn new(mime_type: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: Some(mime_type.into()),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.content.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub document_uri: String,
    /// Version string of the output stage that is delivering.
    pub output_version: String,
    pub authority_name: String,
    pub document: Arc<RepositoryDocument>,
}

#[derive(Debug, Clone)]
pub struct RemoveRequest {
    pub document_uri: String,
    pub output_version: String,
}

/// A live destination. Futures are `'static` so each attempt can run on its own task and be
/// abandoned on cancellation.
pub trait OutputConnector: Send + Sync {
    fn add_or_replace(&self, request: IngestRequest) -> BoxFuture<'static, Result<(), DeliveryFault>>;
    fn remove(&self, request: RemoveRequest) -> BoxFuture<'static, Result<(), DeliveryFault>>;
    fn commit(&self) -> BoxFuture<'static, Result<(), DeliveryFault>>;
    /// Status check; returns a short human-readable health message.
    fn check(&self) -> BoxFuture<'static, Result<String, DeliveryFault>>;
}

impl<T> OutputConnector for Arc<T>
where
    T: OutputConnector + ?Sized,
{
    fn add_or_replace(&self, request: IngestRequest) -> BoxFuture<'static, Result<(), DeliveryFault>> {
        (**self).add_or_replace(request)
    }

    fn remove(&self, request: RemoveRequest) -> BoxFuture<'static, Result<(), DeliveryFault>> {
        (**self).remove(request)
    }

    fn commit(&self) -> BoxFuture<'static, Result<(), DeliveryFault>> {
        (**self).commit()
    }

    fn check(&self) -> BoxFuture<'static, Result<String, DeliveryFault>> {
        (**self).check()
    }
}

/// Builds connectors for one implementation identifier.
pub trait ConnectorFactory: Send + Sync {
    fn connect(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<dyn OutputConnector>, LedgerError>;
}

impl<F> ConnectorFactory for F
where
    F: Fn(&ConnectionDefinition) -> Result<Arc<dyn OutputConnector>, LedgerError> + Send + Sync,
{
    fn connect(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<dyn OutputConnector>, LedgerError> {
        self(definition)
    }
}

/// Installed connector implementations, keyed by implementation identifier.
///
/// Created once at startup and passed to whatever needs it; [`ConnectorRegistry::shutdown`]
/// empties it at process exit.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class_name: impl Into<String>, factory: Arc<dyn ConnectorFactory>) {
        let class_name = class_name.into();
        tracing::info!(event = "connector_registered", class_name = %class_name, "registered connector implementation");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class_name, factory);
    }

    pub fn unregister(&self, class_name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(class_name)
            .is_some()
    }

    pub fn installed(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Builds a connector for `definition` using its implementation identifier.
    pub fn instantiate(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<dyn OutputConnector>, LedgerError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&definition.class_name)
            .cloned()
            .ok_or_else(|| {
                LedgerError::Configuration(format!(
                    "connector implementation '{}' for connection '{}' is not installed",
                    definition.class_name, definition.name
                ))
            })?;
        factory.connect(definition)
    }

    pub fn shutdown(&self) {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        let count = factories.len();
        factories.clear();
        tracing::info!(event = "connector_registry_shutdown", connectors = count, "cleared connector registry");
    }
}

impl ConnectorCatalog for ConnectorRegistry {
    fn is_installed(&self, class_name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(class_name)
    }
}
