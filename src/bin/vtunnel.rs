//! vtunnel
//!
//! Tunnels TCP connections between a host and a guest VM over VM sockets:
//! - `host` finds the VM running the peer, listens on its VM socket port and
//!   forwards every connection to an upstream address or named pipe
//! - `peer` runs inside the VM, answers the handshake and forwards local TCP
//!   connections to the host

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vmbridge::config::{Config, TunnelDefinition, VmTransport};
use vmbridge::protocol::HandshakeMode;
use vmbridge::shutdown::{wait_for_signal, Shutdown, ShutdownSignal};
use vmbridge::transport::{TcpSockets, TransportConfig, VmSockets};
use vmbridge::tunnel::{run_host_tunnels, run_peer_tunnels};

/// vtunnel - VM socket tunnel between host and guest
#[derive(Parser, Debug)]
#[command(name = "vtunnel")]
#[command(about = "Tunnel TCP connections between a host and a VM over VM sockets")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    /// Append logs to this file
    #[arg(long, global = true)]
    log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run on the host: discover the VM and forward to the upstream
    Host(HostArgs),
    /// Run inside the VM: answer the handshake and forward to the host
    Peer(PeerArgs),
}

#[derive(clap::Args, Debug)]
struct HostArgs {
    /// Tunnel configuration file (YAML, or TOML with a .toml extension)
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Address connections are forwarded to (host:port, npipe://..., unix://...)
    #[arg(long, required_unless_present = "config_path")]
    upstream_address: Option<String>,

    /// Port the peer answers handshakes on
    #[arg(long, required_unless_present = "config_path")]
    handshake_port: Option<u32>,

    /// VM socket port to listen on
    #[arg(long, required_unless_present = "config_path")]
    vsock_port: Option<u32>,

    /// VM id to race during discovery (repeatable)
    #[arg(long = "candidate")]
    candidates: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(clap::Args, Debug)]
struct PeerArgs {
    /// Tunnel configuration file (YAML, or TOML with a .toml extension)
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Address the local TCP listener binds to
    #[arg(long, required_unless_present = "config_path")]
    listen_address: Option<String>,

    /// Port the local TCP listener binds to
    #[arg(long, required_unless_present = "config_path")]
    tcp_port: Option<u16>,

    /// Port to answer handshakes on
    #[arg(long, required_unless_present = "config_path")]
    handshake_port: Option<u32>,

    /// VM socket port the host listens on
    #[arg(long, required_unless_present = "config_path")]
    host_port: Option<u32>,

    /// Id of the host (vsock cid, or IP address with --transport tcp)
    #[arg(long)]
    host_id: Option<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// VM socket transport (vsock, tcp)
    #[arg(long, value_parser = parse_transport)]
    transport: Option<VmTransport>,

    /// Local address TCP transport listeners bind to
    #[arg(long)]
    bind_address: Option<String>,

    /// Handshake timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Handshake mode (two-phase, one-shot)
    #[arg(long)]
    mode: Option<HandshakeMode>,
}

fn parse_transport(s: &str) -> std::result::Result<VmTransport, String> {
    match s.to_lowercase().as_str() {
        "vsock" => Ok(VmTransport::Vsock),
        "tcp" => Ok(VmTransport::Tcp),
        other => Err(format!("unknown transport: {}", other)),
    }
}

fn load_or_default(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

impl CommonArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(transport) = self.transport {
            config.vm.transport = transport;
        }
        if let Some(bind_address) = &self.bind_address {
            config.vm.bind_address = bind_address.clone();
        }
        if let Some(timeout) = self.timeout_secs {
            config.handshake.timeout_secs = timeout;
        }
        if let Some(mode) = self.mode {
            config.handshake.mode = mode;
        }
    }
}

impl HostArgs {
    fn into_config(self) -> Result<Config> {
        let mut config = load_or_default(&self.config_path)?;
        if let (Some(upstream), Some(handshake_port), Some(vsock_port)) =
            (self.upstream_address, self.handshake_port, self.vsock_port)
        {
            // Peer fields are unused on the host side
            config.tunnel = vec![TunnelDefinition {
                handshake_port,
                vsock_host_port: vsock_port,
                peer_address: "127.0.0.1".to_string(),
                peer_port: 1,
                upstream_server_address: upstream,
            }];
        }
        if !self.candidates.is_empty() {
            config.vm.candidates = self.candidates;
        }
        self.common.apply(&mut config);
        Ok(config)
    }
}

impl PeerArgs {
    fn into_config(self) -> Result<Config> {
        let mut config = load_or_default(&self.config_path)?;
        if let (Some(listen_address), Some(tcp_port), Some(handshake_port), Some(host_port)) = (
            self.listen_address,
            self.tcp_port,
            self.handshake_port,
            self.host_port,
        ) {
            // The upstream is only used on the host side
            config.tunnel = vec![TunnelDefinition {
                handshake_port,
                vsock_host_port: host_port,
                peer_address: listen_address,
                peer_port: tcp_port,
                upstream_server_address: "127.0.0.1:1".to_string(),
            }];
        }
        if self.host_id.is_some() {
            config.vm.host = self.host_id;
        }
        self.common.apply(&mut config);
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Peer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (role, mut config) = match args.command {
        Command::Host(host) => (Role::Host, host.into_config()?),
        Command::Peer(peer) => (Role::Peer, peer.into_config()?),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_file.is_some() {
        config.logging.file = args.log_file;
    }

    vmbridge::logging::init(&config.logging)?;
    config.validate().context("Invalid tunnel configuration")?;

    info!(
        "vtunnel {} starting {} tunnels as {:?} over {:?}",
        vmbridge::VERSION,
        config.tunnel.len(),
        role,
        config.vm.transport
    );

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    let tunnels = run(role, &config, signal);
    tokio::pin!(tunnels);

    tokio::select! {
        res = &mut tunnels => return res,
        res = wait_for_signal() => res.context("Failed to wait for shutdown signal")?,
    }

    shutdown.trigger();
    tunnels.await?;
    info!("vtunnel stopped");
    Ok(())
}

async fn run(role: Role, config: &Config, shutdown: ShutdownSignal) -> Result<()> {
    match config.vm.transport {
        VmTransport::Tcp => {
            let bind_address: IpAddr = config
                .vm
                .bind_address
                .parse()
                .with_context(|| format!("Invalid bind address {}", config.vm.bind_address))?;
            let candidates = config
                .vm
                .candidates
                .iter()
                .map(|c| c.parse::<IpAddr>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Invalid candidate VM address")?;
            let sockets = TcpSockets::new(candidates, bind_address)
                .with_connect_timeout(TransportConfig::default().connect_timeout());
            run_with(Arc::new(sockets), role, config, shutdown, None).await
        }
        VmTransport::Vsock => run_vsock(role, config, shutdown).await,
    }
}

#[cfg(all(feature = "vsock", target_os = "linux"))]
async fn run_vsock(role: Role, config: &Config, shutdown: ShutdownSignal) -> Result<()> {
    use vmbridge::transport::{VsockSockets, HOST_CID};

    let candidates = config
        .vm
        .candidates
        .iter()
        .map(|c| c.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Invalid candidate VM cid")?;
    let sockets = Arc::new(VsockSockets::new(candidates));
    run_with(sockets, role, config, shutdown, Some(HOST_CID)).await
}

#[cfg(not(all(feature = "vsock", target_os = "linux")))]
async fn run_vsock(_role: Role, _config: &Config, _shutdown: ShutdownSignal) -> Result<()> {
    anyhow::bail!("vsock transport is not available in this build, use --transport tcp")
}

async fn run_with<P: VmSockets>(
    sockets: Arc<P>,
    role: Role,
    config: &Config,
    shutdown: ShutdownSignal,
    default_host: Option<P::Id>,
) -> Result<()> {
    match role {
        Role::Host => {
            run_host_tunnels(
                sockets,
                &config.tunnel,
                &config.handshake,
                TransportConfig::default().connect_timeout(),
                shutdown,
            )
            .await?
        }
        Role::Peer => {
            let host = match &config.vm.host {
                Some(id) => sockets.parse_id(id)?,
                None => default_host
                    .ok_or_else(|| anyhow!("--host-id is required with the tcp transport"))?,
            };
            run_peer_tunnels(sockets, host, &config.tunnel, &config.handshake, shutdown).await?
        }
    }
    Ok(())
}
