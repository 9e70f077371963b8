//! UDP datagram forwarding for published `/udp` ports

use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// A bound published UDP port plus the socket connected to its upstream
pub(super) struct UdpForwarder {
    local: UdpSocket,
    upstream: UdpSocket,
    target: SocketAddr,
    buffer_size: usize,
}

impl UdpForwarder {
    /// Bind `listen_addr` and connect a fresh socket to `target`
    pub(super) async fn open(
        listen_addr: &str,
        target: &str,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let local = UdpSocket::bind(listen_addr).await?;

        let target = tokio::net::lookup_host(target).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for {}", target),
            )
        })?;
        let unspecified = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let upstream = UdpSocket::bind(unspecified).await?;
        upstream.connect(target).await?;

        Ok(Self {
            local,
            upstream,
            target,
            buffer_size,
        })
    }

    pub(super) fn local_addr(&self) -> String {
        self.local
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }

    /// Relay datagrams until `stop` fires.
    ///
    /// Replies from the upstream go back to whoever sent the latest datagram.
    pub(super) async fn run(self, mut stop: oneshot::Receiver<()>) {
        let mut inbound = vec![0u8; self.buffer_size];
        let mut replies = vec![0u8; self.buffer_size];
        let mut last_sender: Option<SocketAddr> = None;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                res = self.local.recv_from(&mut inbound) => match res {
                    Ok((n, from)) => {
                        debug!("port proxy: received {} bytes of UDP from {}", n, from);
                        last_sender = Some(from);
                        if let Err(e) = self.upstream.send(&inbound[..n]).await {
                            error!(
                                "port proxy: error forwarding UDP packet to {}: {}",
                                self.target, e
                            );
                        }
                    }
                    Err(e) => error!("port proxy: error reading UDP packet: {}", e),
                },
                res = self.upstream.recv(&mut replies) => match res {
                    Ok(n) => match last_sender {
                        Some(to) => {
                            if let Err(e) = self.local.send_to(&replies[..n], to).await {
                                warn!("port proxy: error relaying UDP reply to {}: {}", to, e);
                            }
                        }
                        None => debug!("port proxy: dropping unsolicited UDP reply"),
                    },
                    // ICMP port unreachable from the upstream surfaces here
                    Err(e) => debug!("port proxy: UDP upstream {}: {}", self.target, e),
                },
            }
        }
        debug!("port proxy: stopped UDP forwarding to {}", self.target);
    }
}
