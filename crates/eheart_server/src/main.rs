use std::sync::Arc;

use anyhow::{Context, Result};
use eheart_core::registry::ModelRegistry;
use eheart_server::config::ServerConfig;
use eheart_server::{logging, server};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env_and_args()?;
    logging::init(&config.log_filter)?;

    let registry = Arc::new(ModelRegistry::with_builtin_models());
    info!(models = ?registry.names(), "model registry loaded");

    let address = config.address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    server::serve(listener, registry, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c, serving until killed");
            std::future::pending::<()>().await;
        }
    })
    .await
}
