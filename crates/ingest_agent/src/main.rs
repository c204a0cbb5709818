use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use ingest_agent_lib::config::AgentConfig;
use ingest_agent_lib::connections::RegistryCollaborators;
use ingest_agent_lib::connectors::ConnectorRegistry;
use ingest_agent_lib::logging::{format_error_report, init_logging};
use ingest_agent_lib::state::AgentContext;
use ledger_core::db::StoreProvider;
use tokio::signal::unix::{signal, SignalKind};

type BoxError = Box<dyn Error + Send + Sync>;

async fn wait_for_shutdown_signal() -> Result<(), BoxError> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!(event = "shutdown_signal", signal = "SIGTERM", "shutting down"),
        _ = sigint.recv() => tracing::info!(event = "shutdown_signal", signal = "SIGINT", "shutting down"),
    }
    Ok(())
}

#[cfg(not(feature = "postgres"))]
fn open_store(
    config: &AgentConfig,
) -> Result<ledger_core::db::SharedConnection<diesel::sqlite::SqliteConnection>, BoxError> {
    use diesel::connection::SimpleConnection;
    use diesel::Connection;

    let mut conn = diesel::sqlite::SqliteConnection::establish(&config.database_url)?;
    conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
    ledger_core::db::migrations::run_sqlite_migrations(&mut conn)?;
    Ok(ledger_core::db::SharedConnection::new(conn))
}

#[cfg(feature = "postgres")]
fn open_store(config: &AgentConfig) -> Result<ledger_core::db::PgStore, BoxError> {
    use diesel::Connection;

    let mut conn = diesel::pg::PgConnection::establish(&config.database_url)?;
    ledger_core::db::migrations::run_postgres_migrations(&mut conn)?;
    Ok(ledger_core::db::PgStore::new(config.database_url.clone()))
}

async fn run<P: StoreProvider>(store: P, config: &AgentConfig) -> Result<(), BoxError> {
    let connectors = Arc::new(ConnectorRegistry::new());
    let collaborators = RegistryCollaborators::new(connectors.clone());
    let context = Arc::new(AgentContext::start(
        store,
        connectors,
        collaborators,
        config.registry_options(),
    ));

    let registry = Arc::clone(&context.registry);
    let definitions = tokio::task::spawn_blocking(move || registry.get_all()).await??;
    tracing::info!(
        event = "output_connections_loaded",
        count = definitions.len(),
        "loaded output connection definitions"
    );

    wait_for_shutdown_signal().await?;
    context.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", format_error_report(&err));
            return ExitCode::FAILURE;
        }
    };
    init_logging("ingest_agent", "agent", "info");

    let result = match open_store(&config) {
        Ok(store) => run(store, &config).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(
                event = "agent_failed",
                error = %format_error_report(err.as_ref()),
                "ingest agent exited with an error"
            );
            ExitCode::FAILURE
        }
    }
}
