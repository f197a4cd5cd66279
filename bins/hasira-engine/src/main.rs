//! Registry-driven indexing service.
//!
//! Loads the YAML service configuration, follows registry contracts over
//! WebSocket subscriptions, decodes and persists events from every announced
//! contract, and serves the contract-aware query API. Registry contracts are
//! added at runtime through the admin endpoint; each announcement spawns a
//! subscription for the announced contract.

use anyhow::{Context, Result};
use hasira::config::Config;
use hasira::http::{cors_layer, service_router, ApiState};
use hasira::subscription::{run_subscription, RawEvent, SubscribeRequest};
use hasira::{ChainProvider, ContractRegistry, EventStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let config = Config::load()?;
    let data_dir = Config::data_dir();
    tracing::info!(
        rpc = %config.rpc.host,
        api = %format!("{}:{}", config.api.host, config.api.port),
        data_dir = %data_dir.display(),
        admin = config.api.admin,
        "Starting hasira engine"
    );

    let store = Arc::new(EventStore::open(&data_dir).context("failed to open event store")?);
    let provider = Arc::new(ChainProvider::new(&config.rpc.host)?);
    let shutdown = CancellationToken::new();

    let (subscribe_tx, mut subscribe_rx) = mpsc::unbounded_channel::<SubscribeRequest>();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<RawEvent>();

    let registry = Arc::new(ContractRegistry::new(
        provider.clone(),
        store.clone(),
        subscribe_tx,
    )?);

    // The directory is derivable from storage: rebuild it before any task
    // starts. Subscription requests queue on the channel until the manager
    // below begins draining them.
    registry
        .load_from_store()
        .await
        .context("failed to restore registry state")?;
    let counts = registry.counts();
    tracing::info!(
        target: "hasira::engine",
        registry_contracts = counts.registry_contracts,
        registered_contracts = counts.registered_contracts,
        "Registry state restored"
    );

    // Subscription manager: one connection task per followed address.
    let manager = {
        let ws_endpoint = provider.ws_endpoint().clone();
        let start_at = config.indexer.start_at;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    () = shutdown.cancelled() => break,
                    request = subscribe_rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let mut request = request;
                if let Some(start_at) = start_at {
                    request.from_block = request.from_block.max(start_at);
                }
                tracing::info!(
                    target: "hasira::engine",
                    address = %format!("{:#x}", request.address),
                    from_block = request.from_block,
                    "Opening subscription"
                );
                tokio::spawn(run_subscription(
                    ws_endpoint.clone(),
                    request,
                    events_tx.clone(),
                    shutdown.clone(),
                ));
            }
        })
    };

    // Registry task: the single consumer of incoming events.
    let registry_task = {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                registry.process_event(&event).await;
            }
        })
    };

    // Query API.
    let state = ApiState::service(store.clone(), registry.clone(), &config);
    let app = service_router(state).layer(cors_layer(&config.api));
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid Api.Host/Api.Port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "API listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    tracing::info!("Interrupt received, shutting down");
    shutdown.cancel();

    let _ = manager.await;
    let _ = registry_task.await;
    if let Err(e) = server.await? {
        tracing::error!(error = %e, "HTTP server error");
    }

    tracing::info!("Engine stopped");
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
