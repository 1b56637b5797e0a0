// [[MISSION]]/apps/kernel-server/src/main.rs
// Purpose: Entry point. Boots the kernel runtime, serves HTTP + WebSocket and
//          tears everything down on ctrl-c.
// Architecture: Application Boot
// Dependencies: Axum, Tokio

mod config;
mod error;
mod events;
mod executor;
mod hub;
mod ledger;
mod models;
mod observability;
mod pool;
mod runtime;
mod server;
mod store;
mod ticker;
mod workflow;

use anyhow::Context;
use std::sync::Arc;

use crate::config::KernelConfig;
use crate::runtime::KernelRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_tracing()?;

    tracing::info!("Initializing mission kernel...");

    let config = KernelConfig::from_env()?;
    let addr = config.bind_addr();
    let runtime = Arc::new(KernelRuntime::from_config(config)?);

    let app = server::router(runtime.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("Mission kernel listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runtime))
        .await
        .context("server error")?;

    tracing::info!("Mission kernel stopped");
    Ok(())
}

/// Open observer sockets would hold graceful shutdown forever, so the runtime
/// is torn down as soon as the signal arrives.
async fn shutdown_signal(runtime: Arc<KernelRuntime>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    runtime.shutdown().await;
}
