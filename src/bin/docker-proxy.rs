//! docker-proxy
//!
//! Serves the Docker API on a local socket and forwards every request to a
//! backend reachable over a named pipe, unix socket, vsock or TCP.
//! `docker attach`/`exec` upgrades are piped through unchanged.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use vmbridge::config::LoggingConfig;
use vmbridge::proxy::ReverseProxy;
use vmbridge::shutdown::{wait_for_signal, Shutdown};
use vmbridge::transport::Endpoint;

/// docker-proxy - upgrade-aware reverse proxy for the Docker API
#[derive(Parser, Debug)]
#[command(name = "docker-proxy")]
#[command(about = "Reverse proxy for the Docker API with protocol upgrade support")]
#[command(version)]
struct Args {
    /// Address clients connect to (unix://, npipe://, host:port)
    #[arg(long)]
    listen: String,

    /// Address of the Docker engine (unix://, npipe://, vsock://cid:port, host:port)
    #[arg(long)]
    backend: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    vmbridge::logging::init(&LoggingConfig {
        level: args.log_level,
        ..LoggingConfig::default()
    })?;

    let listen: Endpoint = args
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", args.listen))?;
    let backend: Endpoint = args
        .backend
        .parse()
        .with_context(|| format!("Invalid backend address {}", args.backend))?;

    let listener = listen
        .listen()
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    if let Endpoint::Unix(path) = &listen {
        make_world_accessible(path)?;
    }

    info!("docker proxy: {} -> {}", listen, backend);

    let shutdown = Shutdown::new();
    let proxy = ReverseProxy::new(backend);
    let serve = proxy.serve(listener, shutdown.subscribe());
    tokio::pin!(serve);

    tokio::select! {
        res = &mut serve => return res.context("Reverse proxy failed"),
        res = wait_for_signal() => res.context("Failed to wait for shutdown signal")?,
    }

    shutdown.trigger();
    serve.await.context("Reverse proxy failed")?;
    info!("docker proxy: stopped");
    Ok(())
}

/// Let every local user reach the socket, like the Docker socket itself
#[cfg(unix)]
fn make_world_accessible(path: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
        .with_context(|| format!("Failed to set permissions on {}", path))
}

#[cfg(not(unix))]
fn make_world_accessible(_path: &str) -> Result<()> {
    Ok(())
}
