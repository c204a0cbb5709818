use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on `output_connections.connection_name`.
pub const MAX_CONNECTION_NAME_LEN: usize = 32;

const DEFAULT_MAX_CONNECTIONS: i32 = 10;

/// Rejected connection definition or configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("connection name must not be empty")]
    EmptyName,
    #[error("connection name '{name}' exceeds {MAX_CONNECTION_NAME_LEN} characters")]
    NameTooLong { name: String },
    #[error("connection '{name}' has no connector implementation identifier")]
    MissingClassName { name: String },
    #[error("connection '{name}' must allow at least one concurrent use, got {max_connections}")]
    InvalidMaxConnections { name: String, max_connections: i32 },
    #[error("malformed configuration document: {0}")]
    MalformedConfig(String),
}

/// Opaque per-connection configuration.
///
/// Keys are kept ordered so the serialized document is canonical: two configurations
/// serialize to the same bytes exactly when they hold the same parameters. Change detection
/// on save and byte-for-byte export/import both depend on that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigParams {
    params: BTreeMap<String, String>,
}

impl ConfigParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.params.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serializes to the canonical document stored in `output_connections.config_document`.
    pub fn to_document(&self) -> String {
        // A string-keyed map of strings always serializes.
        serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parses a stored document. An empty document is an empty configuration.
    pub fn from_document(document: &str) -> Result<Self, DefinitionError> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(document).map_err(|err| DefinitionError::MalformedConfig(err.to_string()))
    }
}

impl<K, V> FromIterator<(K, V)> for ConfigParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Named destination-connection definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDefinition {
    pub name: String,
    pub description: String,
    /// Identifier of the connector implementation that serves this connection.
    pub class_name: String,
    pub max_connections: i32,
    pub config: ConfigParams,
}

impl ConnectionDefinition {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            class_name: class_name.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            config: ConfigParams::default(),
        }
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.name.chars().count() > MAX_CONNECTION_NAME_LEN {
            return Err(DefinitionError::NameTooLong {
                name: self.name.clone(),
            });
        }
        if self.class_name.trim().is_empty() {
            return Err(DefinitionError::MissingClassName {
                name: self.name.clone(),
            });
        }
        if self.max_connections < 1 {
            return Err(DefinitionError::InvalidMaxConnections {
                name: self.name.clone(),
                max_connections: self.max_connections,
            });
        }
        Ok(())
    }
}

impl Default for ConnectionDefinition {
    fn default() -> Self {
        Self::new(String::new(), String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigParams, ConnectionDefinition, DefinitionError};

    #[test]
    fn config_document_is_canonical_regardless_of_insert_order() {
        let mut first = ConfigParams::new();
        first.set("b", "2").set("a", "1");
        let second: ConfigParams = [("a", "1"), ("b", "2")].into_iter().collect();

        assert_eq!(first.to_document(), second.to_document());
        assert_eq!(first.to_document(), r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn config_document_parses_back_and_tolerates_empty() {
        let params: ConfigParams = [("url", "http://localhost:8983/solr")].into_iter().collect();
        let parsed = ConfigParams::from_document(&params.to_document()).expect("valid document");
        assert_eq!(parsed, params);

        assert!(ConfigParams::from_document("").expect("empty").is_empty());
        assert!(matches!(
            ConfigParams::from_document("{not json"),
            Err(DefinitionError::MalformedConfig(_))
        ));
    }

    #[test]
    fn validation_enforces_name_class_and_capacity() {
        assert_eq!(
            ConnectionDefinition::new("", "solr").validate(),
            Err(DefinitionError::EmptyName)
        );
        assert!(matches!(
            ConnectionDefinition::new("x".repeat(33), "solr").validate(),
            Err(DefinitionError::NameTooLong { .. })
        ));
        assert!(ConnectionDefinition::new("x".repeat(32), "solr").validate().is_ok());
        assert!(matches!(
            ConnectionDefinition::new("conn1", " ").validate(),
            Err(DefinitionError::MissingClassName { .. })
        ));

        let mut def = ConnectionDefinition::new("conn1", "solr");
        def.max_connections = 0;
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::InvalidMaxConnections { .. })
        ));
    }
}
