//! `OrderCore` server.
//!
//! Serves the HTTP routes, follows the store's change feed with the status
//! synchronizer and runs the reconciliation sweep on its interval. Without
//! `DATABASE_URL` the state lives in memory and is lost on exit.

use std::sync::Arc;

use anyhow::Context;
use ordercore::store::OrderStore;
use ordercore::Engine;
use ordercore_memory::InMemoryOrderStore;
use ordercore_postgres::PostgresOrderStore;
use ordercore_server::{init_logging, router, AppState, ServerConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;
    init_logging(config.log_format).context("failed to install the tracing subscriber")?;

    let store: Arc<dyn OrderStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresOrderStore::new(url.as_str())
                .await
                .context("failed to connect to PostgreSQL")?;
            store.migrate().await.context("failed to migrate the schema")?;
            info!("Using PostgreSQL order store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL is not set, using the in-memory order store");
            Arc::new(InMemoryOrderStore::new())
        }
    };

    let engine = Engine::new(store).with_config(config.engine.clone());
    let sync = engine.synchronizer().start();
    let sweep = engine
        .sweep()
        .spawn_schedule(config.engine.sweep_interval.as_duration());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "OrderCore server listening");

    axum::serve(listener, router(AppState::new(engine)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down background tasks");
    sync.shutdown().await.context("status synchronizer panicked")?;
    sweep.shutdown().await.context("sweep scheduler panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Could not listen for Ctrl+C; shutting down");
    }
}
