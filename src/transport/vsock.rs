//! vsock transport (Linux)

use super::{BoxedStream, Listener, TransportError, VmSockets};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio_vsock::{VsockAddr, VsockStream, VMADDR_CID_ANY};

/// Context id of the host as seen from a guest
pub const HOST_CID: u32 = 2;

pub(super) async fn connect(cid: u32, port: u32, timeout: Duration) -> io::Result<BoxedStream> {
    let stream = tokio::time::timeout(timeout, VsockStream::connect(VsockAddr::new(cid, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "vsock connect timed out"))??;
    Ok(Box::new(stream))
}

/// VM sockets over AF_VSOCK, ids are context ids
#[derive(Debug, Clone)]
pub struct VsockSockets {
    candidates: Vec<u32>,
    connect_timeout: Duration,
}

impl VsockSockets {
    pub fn new(candidates: Vec<u32>) -> Self {
        Self {
            candidates,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl VmSockets for VsockSockets {
    type Id = u32;

    async fn candidates(&self) -> Result<Vec<u32>, TransportError> {
        Ok(self.candidates.clone())
    }

    fn parse_id(&self, s: &str) -> Result<u32, TransportError> {
        s.parse()
            .map_err(|_| TransportError::InvalidAddress(format!("invalid vsock cid: {}", s)))
    }

    async fn dial(&self, id: &u32, port: u32) -> io::Result<BoxedStream> {
        connect(*id, port, self.connect_timeout).await
    }

    async fn listen(&self, id: Option<&u32>, port: u32) -> io::Result<Listener> {
        // vsock cannot bind to a remote cid; bind any and filter on accept.
        Listener::bind_vsock(VMADDR_CID_ANY, port, id.copied())
    }
}
