//! Standalone indexer binary: one contract, one event, push with polling
//! fallback, local query API.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Cli;
use hasira::http::{standalone_router, ApiState};
use hasira::{EventStore, Indexer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Missing required flags terminate with exit code 1, not clap's
            // default.
            let _ = e.print();
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!(
        contract = %cli.contract,
        event = %cli.event,
        order_by = cli.order_by,
        unique = cli.unique,
        start_block = cli.start_block,
        rpc = %cli.rpc,
        network = %cli.network,
        data_dir = %cli.data_dir.display(),
        "Starting hasira indexer"
    );

    let store = Arc::new(EventStore::open(&cli.data_dir).context("failed to open event store")?);
    let shutdown = CancellationToken::new();
    let indexer = Arc::new(Indexer::new(cli.indexer_config(), store.clone(), shutdown.clone())?);

    // Query API.
    let state = ApiState::standalone(store.clone(), indexer.status(), indexer.config());
    let app = standalone_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Query API listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let mut ingest = {
        let indexer = indexer.clone();
        tokio::spawn(async move { indexer.run().await })
    };

    tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("Interrupt received, shutting down");
        }
        result = &mut ingest => {
            match result {
                Ok(Ok(())) => tracing::info!("Ingestion finished"),
                Ok(Err(e)) => tracing::error!(error = %e, "Ingestion failed"),
                Err(e) => tracing::error!(error = %e, "Ingestion task panicked"),
            }
        }
    }
    shutdown.cancel();

    if !ingest.is_finished() {
        if let Ok(Err(e)) = ingest.await {
            tracing::error!(error = %e, "Ingestion failed during shutdown");
        }
    }
    if let Err(e) = server.await? {
        tracing::error!(error = %e, "HTTP server error");
    }

    tracing::info!("Indexer stopped");
    Ok(())
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
        () = ctrl_c => {}
        _ = terminate => {}
    }
}
