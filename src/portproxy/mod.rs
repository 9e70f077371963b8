//! Port proxy - publishes container ports on the host
//!
//! A [`PortProxy`] reads one JSON [`PortMapping`] per control-channel
//! connection and opens (or closes) local listeners that forward to the
//! upstream address. [`netsh`] drives the Windows `netsh interface portproxy`
//! equivalent for the privileged service.

pub mod netsh;
mod registry;
mod types;
mod udp;

pub use registry::Registry;
pub use types::{
    protocol_of, read_mapping, ConnectAddr, PortBinding, PortMapping, Protocol,
    DEFAULT_LISTEN_IP, MAX_MAPPING_SIZE,
};

use crate::shutdown::{Shutdown, WaitGroup};
use crate::transport::{connect_tcp, join_host_port, BoxedStream, Endpoint, Listener};
use crate::tunnel::{is_transient_accept_error, splice};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use udp::UdpForwarder;

/// Port proxy errors
#[derive(Debug, Error)]
pub enum PortProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(io::Error),

    #[error("failed to decode port mapping: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("empty port mapping message")]
    EmptyMessage,

    #[error("port mapping message too large ({0} bytes)")]
    MessageTooLarge(usize),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("port proxy already started")]
    AlreadyStarted,

    #[error("port proxy is closed")]
    Closed,

    #[error("failed to close listeners: {}", .0.join("; "))]
    Close(Vec<String>),

    #[error("failed to remove port proxies: {}", .0.join("; "))]
    RemoveAll(Vec<String>),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
}

/// Default UDP datagram buffer (largest IPv4 UDP payload)
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 65507;

/// Port proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream host, or a fixed `host:port` every published port forwards to
    pub upstream_address: String,
    /// Size of each UDP datagram buffer
    pub udp_buffer_size: usize,
    /// Timeout for dialing the upstream
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(upstream_address: impl Into<String>) -> Self {
        Self {
            upstream_address: upstream_address.into(),
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Where connections to a published `port` are forwarded
pub fn forward_target(upstream: &str, port: u16) -> String {
    if upstream.parse::<SocketAddr>().is_ok() {
        return upstream.to_string();
    }
    let host = upstream.trim_start_matches('[').trim_end_matches(']');
    if host.parse::<IpAddr>().is_ok() {
        return join_host_port(host, port);
    }
    match upstream.rsplit_once(':') {
        Some((name, p)) if !name.contains(':') && p.parse::<u16>().is_ok() => upstream.to_string(),
        _ => join_host_port(host, port),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Running,
    Stopped,
}

/// Forwarding listener for one published port
struct ActiveListener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    local: String,
}

impl ActiveListener {
    /// Stop the accept task and wait until it has dropped its socket
    async fn close(self) -> Result<(), String> {
        let _ = self.stop.send(());
        self.task
            .await
            .map_err(|e| format!("{}: {}", self.local, e))
    }
}

struct Inner {
    config: ProxyConfig,
    control: Mutex<Option<Listener>>,
    state: Mutex<State>,
    quit: Shutdown,
    control_closed: watch::Sender<bool>,
    tcp_listeners: Registry<u16, ActiveListener>,
    udp_listeners: Registry<u16, ActiveListener>,
    tasks: WaitGroup,
}

/// Marks the control listener as gone, even if `start` is cancelled
struct ControlClosed<'a>(&'a watch::Sender<bool>);

impl Drop for ControlClosed<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Control-channel driven port forwarder.
///
/// Lifecycle is `new` -> [`start`](PortProxy::start) -> [`close`](PortProxy::close);
/// a closed proxy cannot be restarted.
#[derive(Clone)]
pub struct PortProxy {
    inner: Arc<Inner>,
}

impl PortProxy {
    pub fn new(control: Listener, config: ProxyConfig) -> Self {
        let (control_closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                control: Mutex::new(Some(control)),
                state: Mutex::new(State::NotStarted),
                quit: Shutdown::new(),
                control_closed,
                tcp_listeners: Registry::new(),
                udp_listeners: Registry::new(),
                tasks: WaitGroup::new(),
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Published TCP ports with a live listener
    pub fn tcp_ports(&self) -> Vec<u16> {
        self.inner.tcp_listeners.keys()
    }

    /// Published UDP ports with a live socket
    pub fn udp_ports(&self) -> Vec<u16> {
        self.inner.udp_listeners.keys()
    }

    fn is_stopped(&self) -> bool {
        *self.inner.state.lock() == State::Stopped
    }

    /// Accept control-channel connections until [`close`](PortProxy::close).
    ///
    /// Each connection is decoded and applied in its own task.
    pub async fn start(&self) -> Result<(), PortProxyError> {
        let mut listener = {
            let mut state = self.inner.state.lock();
            match *state {
                State::Running => return Err(PortProxyError::AlreadyStarted),
                State::Stopped => return Err(PortProxyError::Closed),
                State::NotStarted => {}
            }
            let listener = self
                .inner
                .control
                .lock()
                .take()
                .ok_or(PortProxyError::Closed)?;
            *state = State::Running;
            listener
        };
        let _closed = ControlClosed(&self.inner.control_closed);

        info!(
            "port proxy: accepting on {}, forwarding to {}",
            listener.describe(),
            self.inner.config.upstream_address
        );

        let mut quit = self.inner.quit.subscribe();
        let result = loop {
            tokio::select! {
                _ = quit.recv() => {
                    debug!("port proxy: received quit signal, leaving accept loop");
                    break Ok(());
                }
                res = listener.accept() => match res {
                    Ok((conn, peer)) => {
                        let Some(guard) = self.inner.tasks.guard() else {
                            break Ok(());
                        };
                        let proxy = self.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            proxy.handle_event(conn, peer).await;
                        });
                    }
                    Err(_) if quit.is_shutdown() => break Ok(()),
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("port proxy: accept control connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => break Err(PortProxyError::Accept(e)),
                },
            }
        };

        drop(listener);
        result
    }

    async fn handle_event(&self, mut conn: BoxedStream, peer: String) {
        let mut quit = self.inner.quit.subscribe();
        let mapping = tokio::select! {
            _ = quit.recv() => return,
            res = read_mapping(&mut conn) => match res {
                Ok(mapping) => mapping,
                Err(e) => {
                    error!("port proxy: decoding payload from {}: {}", peer, e);
                    return;
                }
            },
        };

        self.exec_listener(&mapping).await;
        // Dropping the connection tells the client the mapping is applied
    }

    /// Apply one mapping: open or close a listener per binding.
    ///
    /// Published ports listen on loopback whatever the binding's `HostIp`,
    /// and a port already published keeps its listener. Problems with a
    /// single binding are logged and do not stop the rest.
    pub async fn exec_listener(&self, mapping: &PortMapping) {
        for (port_proto, bindings) in &mapping.ports {
            let proto = protocol_of(port_proto);
            debug!(
                "port proxy: {} [{}] with bindings {:?}",
                if mapping.remove { "removing" } else { "adding" },
                port_proto,
                bindings
            );

            match proto {
                Protocol::Tcp => self.handle_tcp(bindings, mapping.remove).await,
                Protocol::Udp => self.handle_udp(bindings, mapping.remove).await,
                Protocol::Other(proto) => warn!("port proxy: unsupported protocol [{}]", proto),
            }
        }
    }

    async fn handle_tcp(&self, bindings: &[PortBinding], remove: bool) {
        let registry = &self.inner.tcp_listeners;
        for binding in bindings {
            let port = match binding.port() {
                Ok(port) => port,
                Err(e) => {
                    error!("port proxy: parsing port: {}", e);
                    continue;
                }
            };

            if remove {
                if let Some(active) = registry.remove(&port) {
                    debug!("port proxy: closing listener for port {}", port);
                    if let Err(e) = active.close().await {
                        error!("port proxy: closing listener for port {}: {}", port, e);
                    }
                }
                continue;
            }

            // One listener per port: later bindings for a published port are ignored
            if registry.contains(&port) {
                debug!(
                    "port proxy: port {} already published, skipping binding {:?}",
                    port, binding
                );
                continue;
            }

            let addr = join_host_port(DEFAULT_LISTEN_IP, port);
            let listener = match Listener::bind_tcp(addr.as_str(), None).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(
                        "port proxy: failed creating listener for published port [{}]: {}",
                        binding.host_port, e
                    );
                    continue;
                }
            };
            let local = listener.describe();
            debug!("port proxy: created listener for {}", local);

            let target = forward_target(&self.inner.config.upstream_address, port);
            let (stop, stopped) = oneshot::channel();
            let task = tokio::spawn(self.clone().accept_traffic(listener, target, stopped));
            self.register(registry, port, ActiveListener { stop, task, local })
                .await;
        }
    }

    async fn handle_udp(&self, bindings: &[PortBinding], remove: bool) {
        let registry = &self.inner.udp_listeners;
        for binding in bindings {
            let port = match binding.port() {
                Ok(port) => port,
                Err(e) => {
                    error!("port proxy: parsing port: {}", e);
                    continue;
                }
            };

            if remove {
                if let Some(active) = registry.remove(&port) {
                    debug!("port proxy: closing UDP socket for port {}", port);
                    if let Err(e) = active.close().await {
                        error!("port proxy: closing UDP socket for port {}: {}", port, e);
                    }
                }
                continue;
            }

            if registry.contains(&port) {
                debug!(
                    "port proxy: UDP port {} already published, skipping binding {:?}",
                    port, binding
                );
                continue;
            }

            let addr = join_host_port(DEFAULT_LISTEN_IP, port);
            let target = forward_target(&self.inner.config.upstream_address, port);
            let forwarder =
                match UdpForwarder::open(&addr, &target, self.inner.config.udp_buffer_size).await
                {
                    Ok(forwarder) => forwarder,
                    Err(e) => {
                        error!(
                            "port proxy: failed creating UDP socket for published port [{}]: {}",
                            binding.host_port, e
                        );
                        continue;
                    }
                };
            let local = forwarder.local_addr();
            debug!("port proxy: created UDP socket for {}", local);

            let (stop, stopped) = oneshot::channel();
            let task = tokio::spawn(forwarder.run(stopped));
            self.register(registry, port, ActiveListener { stop, task, local })
                .await;
        }
    }

    async fn register(&self, registry: &Registry<u16, ActiveListener>, port: u16, active: ActiveListener) {
        if let Some(replaced) = registry.add(port, active) {
            if let Err(e) = replaced.close().await {
                error!("port proxy: closing replaced listener for port {}: {}", port, e);
            }
        }

        // close() may already have drained the registry
        if self.is_stopped() {
            if let Some(late) = registry.remove(&port) {
                let _ = late.close().await;
            }
        }
    }

    async fn accept_traffic(
        self,
        mut listener: Listener,
        target: String,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            let (conn, peer) = tokio::select! {
                _ = &mut stop => break,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("port proxy: listener failed to accept: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            debug!("port proxy: accepted TCP connection from {}", peer);

            let Some(guard) = self.inner.tasks.guard() else {
                break;
            };
            let target = target.clone();
            let timeout = self.inner.config.connect_timeout;
            tokio::spawn(async move {
                let _guard = guard;
                let dial = async {
                    let stream = connect_tcp(target.as_str(), timeout).await?;
                    Ok::<BoxedStream, io::Error>(Box::new(stream))
                };
                splice("port proxy", conn, &target, dial).await;
            });
        }
        debug!("port proxy: stopped accepting on {}", listener.describe());
    }

    /// Shut the proxy down.
    ///
    /// Closes every published listener, stops the control-channel accept
    /// loop and waits for every forwarded connection to finish. Calling it
    /// again is a no-op.
    pub async fn close(&self) -> Result<(), PortProxyError> {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), State::Stopped);
        if previous == State::Stopped {
            return Ok(());
        }

        let mut failures = Vec::new();
        for (port, active) in self.inner.tcp_listeners.drain_all() {
            if let Err(e) = active.close().await {
                failures.push(format!("tcp port {}: {}", port, e));
            }
        }
        for (port, active) in self.inner.udp_listeners.drain_all() {
            if let Err(e) = active.close().await {
                failures.push(format!("udp port {}: {}", port, e));
            }
        }

        self.inner.quit.trigger();
        if previous == State::NotStarted {
            self.inner.control.lock().take();
        } else {
            let mut closed = self.inner.control_closed.subscribe();
            let _ = closed.wait_for(|closed| *closed).await;
        }

        self.inner.tasks.wait().await;
        info!("port proxy: closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PortProxyError::Close(failures))
        }
    }
}

/// Send one mapping over a control channel and wait until it was applied
pub async fn send_mapping(
    control: &Endpoint,
    mapping: &PortMapping,
    timeout: Duration,
) -> Result<(), PortProxyError> {
    let payload = serde_json::to_vec(mapping)?;

    let mut conn = control.dial(timeout).await?;
    conn.write_all(&payload).await?;
    conn.shutdown().await?;

    // The server closes the connection once the mapping is applied
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pong_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(b"pong").await;
                });
            }
        });
        addr
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn new_proxy(upstream: &str) -> PortProxy {
        let control = Listener::bind_tcp("127.0.0.1:0", None).await.unwrap();
        PortProxy::new(control, ProxyConfig::new(upstream))
    }

    #[test]
    fn test_forward_target() {
        assert_eq!(forward_target("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(forward_target("127.0.0.1:9000", 8080), "127.0.0.1:9000");
        assert_eq!(forward_target("::1", 80), "[::1]:80");
        assert_eq!(forward_target("[::1]", 80), "[::1]:80");
        assert_eq!(forward_target("[::1]:9000", 80), "[::1]:9000");
        assert_eq!(forward_target("upstream.local", 80), "upstream.local:80");
        assert_eq!(forward_target("upstream.local:9000", 80), "upstream.local:9000");
    }

    #[tokio::test]
    async fn test_add_forward_and_remove() {
        let upstream = pong_server().await;
        let proxy = new_proxy(&upstream.to_string()).await;
        let port = free_port().await;

        let mapping = PortMapping::single(&format!("{}/tcp", port), "127.0.0.1", port);
        proxy.exec_listener(&mapping).await;
        assert_eq!(proxy.tcp_ports(), vec![port]);

        let mut client = connect_tcp(("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
        drop(client);

        proxy.exec_listener(&mapping.clone().into_remove()).await;
        assert!(proxy.tcp_ports().is_empty());
        let err = connect_tcp(("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let proxy = new_proxy("127.0.0.1").await;
        let port = free_port().await;
        let mapping = PortMapping::single("80/tcp", "", port);

        // Never added
        proxy.exec_listener(&mapping.clone().into_remove()).await;

        proxy.exec_listener(&mapping).await;
        proxy.exec_listener(&mapping.clone().into_remove()).await;
        proxy.exec_listener(&mapping.clone().into_remove()).await;
        assert!(proxy.tcp_ports().is_empty());

        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_one_listener() {
        let proxy = new_proxy("127.0.0.1").await;
        let port = free_port().await;
        let mapping = PortMapping::single("80/tcp", "127.0.0.1", port);

        proxy.exec_listener(&mapping).await;
        proxy.exec_listener(&mapping).await;
        assert_eq!(proxy.tcp_ports(), vec![port]);

        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dual_stack_bindings_share_one_listener() {
        let upstream = pong_server().await;
        let proxy = new_proxy(&upstream.to_string()).await;
        let port = free_port().await;

        let mut mapping = PortMapping::single("80/tcp", "0.0.0.0", port);
        mapping.ports.get_mut("80/tcp").unwrap().push(PortBinding {
            host_ip: "::".to_string(),
            host_port: port.to_string(),
        });
        proxy.exec_listener(&mapping).await;
        assert_eq!(proxy.tcp_ports(), vec![port]);

        // The second binding must not tear down the first
        let mut client = connect_tcp(("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
        drop(client);

        proxy.exec_listener(&mapping.into_remove()).await;
        assert!(proxy.tcp_ports().is_empty());
        let err = connect_tcp(("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_bindings_do_not_stop_the_rest() {
        let proxy = new_proxy("127.0.0.1").await;
        let port = free_port().await;

        let mut mapping = PortMapping::single("80/tcp", "127.0.0.1", port);
        mapping.ports.get_mut("80/tcp").unwrap().insert(
            0,
            PortBinding {
                host_ip: String::new(),
                host_port: "not-a-port".to_string(),
            },
        );
        mapping.ports.insert("9/sctp".to_string(), Vec::new());

        proxy.exec_listener(&mapping).await;
        assert_eq!(proxy.tcp_ports(), vec![port]);
        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_after_close() {
        let proxy = new_proxy("127.0.0.1").await;
        let running = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.start().await }
        });
        tokio::task::yield_now().await;
        while *proxy.inner.state.lock() != State::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(
            proxy.start().await,
            Err(PortProxyError::AlreadyStarted)
        ));

        proxy.close().await.unwrap();
        running.await.unwrap().unwrap();
        assert!(matches!(proxy.start().await, Err(PortProxyError::Closed)));

        // Second close is a no-op
        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_without_start() {
        let proxy = new_proxy("127.0.0.1").await;
        let port = free_port().await;
        proxy
            .exec_listener(&PortMapping::single("80/udp", "127.0.0.1", port))
            .await;
        assert_eq!(proxy.udp_ports(), vec![port]);

        tokio::time::timeout(Duration::from_secs(5), proxy.close())
            .await
            .unwrap()
            .unwrap();
        assert!(proxy.udp_ports().is_empty());
    }
}
