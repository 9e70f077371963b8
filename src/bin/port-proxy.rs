//! port-proxy
//!
//! Publishes container ports on the host. Port mappings arrive as JSON on a
//! control socket; every published port gets a local listener that forwards
//! to the upstream (usually the VM address).

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use vmbridge::config::LoggingConfig;
use vmbridge::portproxy::{PortProxy, ProxyConfig, DEFAULT_UDP_BUFFER_SIZE};
use vmbridge::shutdown::wait_for_signal;
use vmbridge::transport::Endpoint;

/// port-proxy - publish container ports from control-socket mappings
#[derive(Parser, Debug)]
#[command(name = "port-proxy")]
#[command(about = "Publish container ports on the host from JSON port mappings")]
#[command(version)]
struct Args {
    /// Control socket to receive mappings on (unix://, npipe://, host:port)
    #[arg(long)]
    control: String,

    /// Upstream host, or a fixed host:port every port forwards to
    #[arg(long)]
    upstream_address: String,

    /// Size of each UDP datagram buffer
    #[arg(long, default_value_t = DEFAULT_UDP_BUFFER_SIZE)]
    udp_buffer_size: usize,

    /// Upstream connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Append logs to this file
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    vmbridge::logging::init(&LoggingConfig {
        level: args.log_level,
        file: args.log_file,
        ..LoggingConfig::default()
    })?;

    let control: Endpoint = args
        .control
        .parse()
        .with_context(|| format!("Invalid control address {}", args.control))?;
    let listener = control
        .listen()
        .await
        .with_context(|| format!("Failed to listen on {}", control))?;

    let mut config = ProxyConfig::new(args.upstream_address);
    config.udp_buffer_size = args.udp_buffer_size;
    config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);

    let proxy = PortProxy::new(listener, config);
    let server = proxy.clone();
    let mut accept = tokio::spawn(async move { server.start().await });

    tokio::select! {
        res = &mut accept => {
            res.context("Control loop panicked")?
                .context("Control loop failed")?;
            return Ok(());
        }
        res = wait_for_signal() => res.context("Failed to wait for shutdown signal")?,
    }

    info!("port proxy: shutting down");
    if let Err(e) = proxy.close().await {
        error!("port proxy: {}", e);
    }
    accept
        .await
        .context("Control loop panicked")?
        .context("Control loop failed")?;
    Ok(())
}
