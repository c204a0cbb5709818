//! Cache-backed store of named output-connection definitions.

pub(crate) mod store;
pub mod transfer;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use diesel::result::Error as DieselError;
use ledger_core::db::{map_diesel_error, StoreDb, StoreError, StoreProvider};
use ledger_core::{ConnectionDefinition, DefinitionError};

use crate::cache::{CacheCoordinator, CacheKey, CacheStatsSnapshot};
use crate::error::LedgerError;

/// Answers whether a connector implementation is installed.
pub trait ConnectorCatalog: Send + Sync {
    fn is_installed(&self, class_name: &str) -> bool;
}

/// Answers whether anything outside the ledger still refers to a connection.
///
/// Called inside the delete transaction; implementations must not use the registry's store.
pub trait ReferenceChecker: Send + Sync {
    fn is_referenced(&self, connection_name: &str) -> Result<bool, LedgerError>;
}

/// Told when a connection's configuration changes.
///
/// Called inside the save transaction; an error rolls the save back. Implementations must
/// not use the registry's store.
pub trait ChangeNotifier: Send + Sync {
    fn output_connection_changed(&self, connection_name: &str) -> Result<(), LedgerError>;
}

/// Reference checker for deployments where nothing but the ledger refers to connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalReferences;

impl ReferenceChecker for NoExternalReferences {
    fn is_referenced(&self, _connection_name: &str) -> Result<bool, LedgerError> {
        Ok(false)
    }
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChangeNotifier;

impl ChangeNotifier for TracingChangeNotifier {
    fn output_connection_changed(&self, connection_name: &str) -> Result<(), LedgerError> {
        tracing::info!(
            event = "output_connection_config_changed",
            connection = connection_name,
            "output connection configuration changed"
        );
        Ok(())
    }
}

/// External services the registry consults.
#[derive(Clone)]
pub struct RegistryCollaborators {
    pub catalog: Arc<dyn ConnectorCatalog>,
    pub references: Arc<dyn ReferenceChecker>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl RegistryCollaborators {
    pub fn new(catalog: Arc<dyn ConnectorCatalog>) -> Self {
        Self {
            catalog,
            references: Arc::new(NoExternalReferences),
            notifier: Arc::new(TracingChangeNotifier),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Largest number of names placed in one `IN (...)` list.
    pub max_in_clause: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self { max_in_clause: 100 }
    }
}

/// Cache population failure. Cloneable so every waiter on a key gets a copy.
#[derive(Debug, Clone)]
pub enum LoadFailure {
    Store(StoreError),
    Malformed(String),
}

impl From<StoreError> for LoadFailure {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<DieselError> for LoadFailure {
    fn from(err: DieselError) -> Self {
        Self::Store(map_diesel_error(err))
    }
}

impl From<DefinitionError> for LoadFailure {
    fn from(err: DefinitionError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<LoadFailure> for LedgerError {
    fn from(err: LoadFailure) -> Self {
        match err {
            LoadFailure::Store(err) => Self::Store(err),
            LoadFailure::Malformed(message) => Self::Configuration(message),
        }
    }
}

#[derive(Debug)]
pub enum CachedValue {
    Names(Vec<String>),
    Definition(ConnectionDefinition),
}

impl CachedValue {
    fn definition(&self) -> Option<&ConnectionDefinition> {
        match self {
            Self::Definition(definition) => Some(definition),
            Self::Names(_) => None,
        }
    }
}

/// Named destination-connection definitions.
///
/// Reads go through a [`CacheCoordinator`]; writes lock the row, commit, and only then
/// invalidate. All methods block and must run off the async runtime's worker threads.
pub struct ConnectionRegistry<P> {
    store: P,
    cache: CacheCoordinator<CacheKey, CachedValue, LoadFailure>,
    collaborators: RegistryCollaborators,
    options: RegistryOptions,
}

impl<P: StoreProvider> ConnectionRegistry<P> {
    pub fn new(store: P, collaborators: RegistryCollaborators, options: RegistryOptions) -> Self {
        Self {
            store,
            cache: CacheCoordinator::new(),
            collaborators,
            options,
        }
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Blank definition to fill in before `save`.
    pub fn create(&self) -> ConnectionDefinition {
        ConnectionDefinition::default()
    }

    pub fn get(&self, name: &str) -> Result<Option<ConnectionDefinition>, LedgerError> {
        let key = CacheKey::Connection(name.to_string());
        let cached = self.cache.get(&key, |_| self.load_one(name))?;
        Ok(cached.and_then(|value| value.definition().cloned()))
    }

    pub fn require(&self, name: &str) -> Result<ConnectionDefinition, LedgerError> {
        self.get(name)?
            .ok_or_else(|| LedgerError::NotFound(name.to_string()))
    }

    /// Definitions for `names`, in order; `None` where a name does not exist.
    pub fn get_multiple(
        &self,
        names: &[String],
    ) -> Result<Vec<Option<ConnectionDefinition>>, LedgerError> {
        let keys: Vec<CacheKey> = names
            .iter()
            .map(|name| CacheKey::Connection(name.clone()))
            .collect();
        let found = self
            .cache
            .get_many(&keys, self.options.max_in_clause, |chunk| self.load_chunk(chunk))?;
        Ok(keys
            .iter()
            .map(|key| {
                found
                    .get(key)
                    .and_then(Option::as_ref)
                    .and_then(|value| value.definition().cloned())
            })
            .collect())
    }

    /// Every connection name, sorted case-insensitively.
    pub fn all_names(&self) -> Result<Vec<String>, LedgerError> {
        let cached = self.cache.get(&CacheKey::AllConnections, |_| {
            let names = self
                .store
                .with_conn(|conn| store::load_all_names(conn).map_err(LoadFailure::from))?;
            Ok(Some(CachedValue::Names(names)))
        })?;
        Ok(match cached.as_deref() {
            Some(CachedValue::Names(names)) => names.clone(),
            _ => Vec::new(),
        })
    }

    /// Every definition, sorted case-insensitively by name.
    pub fn get_all(&self) -> Result<Vec<ConnectionDefinition>, LedgerError> {
        let names = self.all_names()?;
        Ok(self.get_multiple(&names)?.into_iter().flatten().collect())
    }

    /// Inserts or updates `definition`. Returns whether its configuration changed, which is
    /// also whether the change notifier was told.
    pub fn save(&self, definition: &ConnectionDefinition) -> Result<bool, LedgerError> {
        definition.validate()?;
        let config_document = definition.config.to_document();
        let notifier = &self.collaborators.notifier;

        let changed = self.store.with_conn(|conn| {
            conn.write_transaction(|conn| -> Result<bool, LedgerError> {
                let prior = store::lock_definition(conn, &definition.name)?;
                let changed = prior.as_ref().map_or(true, |row| {
                    row.config_document.as_deref().unwrap_or_default() != config_document
                });
                if changed {
                    notifier.output_connection_changed(&definition.name)?;
                }
                if prior.is_some() {
                    store::update_definition(conn, definition, &config_document)?;
                } else {
                    store::insert_definition(conn, definition, &config_document)?;
                }
                Ok(changed)
            })
        })?;

        self.invalidate(&definition.name);
        tracing::info!(
            event = "output_connection_saved",
            connection = %definition.name,
            class_name = %definition.class_name,
            config_changed = changed,
            "saved output connection"
        );
        Ok(changed)
    }

    /// Deletes the named connection. Refuses while the ledger or an external entity still
    /// refers to it; an absent name is a no-op.
    pub fn delete(&self, name: &str) -> Result<(), LedgerError> {
        let references = &self.collaborators.references;
        let deleted = self.store.with_conn(|conn| {
            conn.write_transaction(|conn| -> Result<bool, LedgerError> {
                if store::lock_definition(conn, name)?.is_none() {
                    return Ok(false);
                }
                if references.is_referenced(name)? {
                    return Err(LedgerError::Conflict(format!(
                        "connection '{name}' is still in use"
                    )));
                }
                let ledger_rows = store::count_ledger_rows(conn, name)?;
                if ledger_rows > 0 {
                    return Err(LedgerError::Conflict(format!(
                        "connection '{name}' still has {ledger_rows} ingestion records"
                    )));
                }
                store::delete_definition(conn, name)?;
                Ok(true)
            })
        })?;

        if deleted {
            self.invalidate(name);
            tracing::info!(event = "output_connection_deleted", connection = name, "deleted output connection");
        }
        Ok(())
    }

    /// Whether the named connection's implementation is installed.
    pub fn check_connector_exists(&self, name: &str) -> Result<bool, LedgerError> {
        let definition = self.require(name)?;
        Ok(self.collaborators.catalog.is_installed(&definition.class_name))
    }

    /// Names of connections served by `class_name`, sorted. Reads the store directly.
    pub fn find_connections_for_connector(&self, class_name: &str) -> Result<Vec<String>, LedgerError> {
        self.store
            .with_conn(|conn| store::names_for_class(conn, class_name).map_err(LedgerError::from))
    }

    /// Writes every definition to `writer` in the versioned export format.
    pub fn export_configuration<W: Write>(&self, writer: &mut W) -> Result<usize, LedgerError> {
        let definitions = self.get_all()?;
        transfer::write_definitions(writer, &definitions)?;
        tracing::info!(event = "output_connections_exported", count = definitions.len(), "exported output connections");
        Ok(definitions.len())
    }

    /// Reads an export stream and saves each definition through [`ConnectionRegistry::save`].
    pub fn import_configuration<R: Read>(&self, reader: &mut R) -> Result<usize, LedgerError> {
        let definitions = transfer::read_definitions(reader)?;
        for definition in &definitions {
            self.save(definition)?;
        }
        tracing::info!(event = "output_connections_imported", count = definitions.len(), "imported output connections");
        Ok(definitions.len())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    fn invalidate(&self, name: &str) {
        self.cache.invalidate([
            &CacheKey::AllConnections,
            &CacheKey::Connection(name.to_string()),
        ]);
    }

    fn load_one(&self, name: &str) -> Result<Option<CachedValue>, LoadFailure> {
        let rows = self
            .store
            .with_conn(|conn| store::load_definitions(conn, &[name]).map_err(LoadFailure::from))?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(CachedValue::Definition(store::row_to_definition(row)?))),
            None => Ok(None),
        }
    }

    fn load_chunk(&self, chunk: &[CacheKey]) -> Result<HashMap<CacheKey, CachedValue>, LoadFailure> {
        let names: Vec<&str> = chunk
            .iter()
            .filter_map(|key| match key {
                CacheKey::Connection(name) => Some(name.as_str()),
                CacheKey::AllConnections => None,
            })
            .collect();
        let rows = self
            .store
            .with_conn(|conn| store::load_definitions(conn, &names).map_err(LoadFailure::from))?;
        rows.into_iter()
            .map(|row| {
                let definition = store::row_to_definition(row)?;
                Ok((
                    CacheKey::Connection(definition.name.clone()),
                    CachedValue::Definition(definition),
                ))
            })
            .collect()
    }
}
