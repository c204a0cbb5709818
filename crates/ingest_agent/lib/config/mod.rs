use std::env;

use thiserror::Error;

use crate::connections::RegistryOptions;

const DEFAULT_MAX_IN_CLAUSE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} must be a positive integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Ledger database URL. Required.
    pub database_url: String,
    /// Batch size for bulk lookups.
    pub max_in_clause: usize,
}

impl AgentConfig {
    /// Reads the process environment after loading an optional `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_in_clause = match lookup("LEDGER_MAX_IN_CLAUSE") {
            None => DEFAULT_MAX_IN_CLAUSE,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => value,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        name: "LEDGER_MAX_IN_CLAUSE",
                        value: raw,
                    })
                }
            },
        };
        Ok(Self {
            database_url,
            max_in_clause,
        })
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            max_in_clause: self.max_in_clause,
        }
    }
}
