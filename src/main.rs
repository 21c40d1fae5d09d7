//! Hopchain - Entry Point
//!
//! Builds the configured route and serves every router with graceful
//! shutdown support.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod bypass;
mod chain;
mod config;
mod dispatch;
mod error;
mod hosts;
mod iface;
mod node;
mod permissions;
mod resolver;
mod route;
mod router;
mod tls;

use config::Config;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hopchain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting hopchain");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: {} serve node(s), {} chain hop(s)",
        config.serve_nodes.len(),
        config.chain_nodes.len()
    );

    // Build the chain and routers; any configuration error aborts startup.
    let assembly = config.route().build().await?;
    let routers: Vec<Arc<router::Router>> =
        assembly.routers.into_iter().map(Arc::new).collect();

    // Serve every router concurrently.
    let mut tasks = Vec::with_capacity(routers.len());
    for router in &routers {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = router.serve().await {
                error!("router error: {}", e);
            }
        }));
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    for handle in &assembly.reload_handles {
        handle.shutdown();
    }
    for router in &routers {
        router.close();
    }

    for task in tasks {
        let _ = task.await;
    }

    info!("hopchain stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
