use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use raft_kv::{Cluster, Config, http};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::parse();
    let port = config.port;
    let cluster = match Cluster::start(config).await {
        Ok(cluster) => Arc::new(cluster),
        Err(err) => {
            error!(error = %err, "could not start cluster");
            return Err(err.into());
        }
    };

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind http port {port}"))?;
    info!("Starting up on http://localhost:{port}");

    axum::serve(listener, http::router(cluster.clone()))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
        .context("http server failed")?;

    info!("shutting down");
    cluster.shutdown();
    Ok(())
}
