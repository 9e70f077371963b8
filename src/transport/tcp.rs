//! TCP dialing helpers

use std::io;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};

/// Connect to `addr` with a timeout and `TCP_NODELAY` set
pub async fn connect_tcp<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    // Configure TCP options
    stream.set_nodelay(true).ok();

    Ok(stream)
}

/// Combine host and port into `host:port`, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
