pub mod cache;
pub mod config;
pub mod connections;
pub mod connectors;
pub mod delivery;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod monitoring;
pub mod state;
