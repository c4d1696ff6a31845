//! The aiproxy HTTP edge: a multi-tenant, OpenAI-compatible reverse proxy
//! in front of heterogeneous LLM providers.
//!
//! This binary wires the `aiproxy-*` crates into a runnable axum service
//! against the bundled in-memory store. A production deployment swaps
//! [`aiproxy_core::store::test_support::InMemoryStore`] for a real
//! Postgres-backed [`aiproxy_core::store::TenantStore`] — the store is an
//! external collaborator this workspace only defines the trait for.

mod errors;
mod middleware;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use aiproxy_core::store::test_support::InMemoryStore;
use aiproxy_core::store::TenantStore;
use aiproxy_core::ProxyConfig;
use clap::Parser;
use tokio::net::TcpListener;

use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "aiproxy-server", about = "Multi-tenant LLM reverse proxy")]
struct Cli {
    /// Path to a TOML config file. Falls back to built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref());
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let store: Arc<dyn TenantStore> = Arc::new(InMemoryStore::default());
    let state = AppState::new(store, config.clone(), None);

    let balance_handle = spawn_balance_loop(&state, config.balance_loop_interval);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {}: {err}", config.listen_addr));
    tracing::info!(addr = %config.listen_addr, "aiproxy-server listening");

    let app = routes::router(state.clone());
    if let Err(err) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server exited with error");
    }

    balance_handle.abort();
    drain_consumer(state).await;
}

fn load_config(path: Option<&std::path::Path>) -> ProxyConfig {
    let Some(path) = path else {
        return ProxyConfig::default();
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => ProxyConfig::from_toml_str(&contents).unwrap_or_else(|err| {
            tracing::error!(error = %err, path = %path.display(), "invalid config file, using defaults");
            ProxyConfig::default()
        }),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "could not read config file, using defaults");
            ProxyConfig::default()
        }
    }
}

fn spawn_balance_loop(state: &AppState, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    let balance_loop = state.balance_loop();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match balance_loop.run_once().await {
                Ok(summary) => tracing::debug!(
                    probed = summary.probed,
                    updated = summary.updated,
                    alerts = summary.alerts_raised,
                    "balance sweep complete"
                ),
                Err(err) => tracing::warn!(error = %err, "balance sweep failed"),
            }
        }
    })
}

/// Drains the consumer's in-flight billing queue before the process exits,
/// ahead of closing the shared-cache and database handles. Only possible
/// once every other clone of the shared state has been dropped, which
/// holds once `axum::serve` above has returned.
async fn drain_consumer(state: AppState) {
    match Arc::try_unwrap(state.consumer) {
        Ok(consumer) => consumer.shutdown().await,
        Err(_still_shared) => {
            tracing::warn!("consumer handle still shared at shutdown; skipping drain");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, stopping new connections");
}
