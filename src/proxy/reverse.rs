//! Reverse proxy for a backend reachable only through a custom dialer
//!
//! Every request gets a fresh backend connection. Responses with status 101
//! turn the client connection into a raw byte pipe to the backend.

use super::flush::{FlushedWriter, FLUSH_INTERVAL};
use super::http::{copy_body, BodyKind, RequestHead, ResponseHead};
use super::ProxyError;
use crate::shutdown::ShutdownSignal;
use crate::transport::{BoxedStream, Endpoint, Listener, TransportConfig};
use crate::tunnel::{is_benign_disconnect, is_transient_accept_error, pipe};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

/// Host every proxied request is addressed to
pub const HOST_HEADER_VALUE: &str = "api.moby.localhost";

/// Opens a connection to the backend
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

#[async_trait]
impl Dialer for Endpoint {
    async fn dial(&self) -> io::Result<BoxedStream> {
        Endpoint::dial(self, TransportConfig::default().connect_timeout()).await
    }
}

/// Request mutation hook, run after the host rewrite
pub type Director = Arc<dyn Fn(&mut RequestHead) + Send + Sync>;

/// Response mutation hook; an error turns the response into a 500
pub type ModifyResponse = Arc<dyn Fn(&mut ResponseHead) -> Result<(), ProxyError> + Send + Sync>;

/// What to do with the client connection after an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    KeepAlive,
    Close,
    Upgraded,
}

type Client = BufReader<BoxedStream>;

/// HTTP/1 reverse proxy with protocol upgrade support
#[derive(Clone)]
pub struct ReverseProxy {
    dialer: Arc<dyn Dialer>,
    director: Option<Director>,
    modify_response: Option<ModifyResponse>,
    flush_interval: Duration,
}

impl ReverseProxy {
    pub fn new<D: Dialer>(dialer: D) -> Self {
        Self {
            dialer: Arc::new(dialer),
            director: None,
            modify_response: None,
            flush_interval: FLUSH_INTERVAL,
        }
    }

    pub fn with_director<F>(mut self, director: F) -> Self
    where
        F: Fn(&mut RequestHead) + Send + Sync + 'static,
    {
        self.director = Some(Arc::new(director));
        self
    }

    pub fn with_modify_response<F>(mut self, modify: F) -> Self
    where
        F: Fn(&mut ResponseHead) -> Result<(), ProxyError> + Send + Sync + 'static,
    {
        self.modify_response = Some(Arc::new(modify));
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Accept clients until shutdown, one task per connection
    pub async fn serve(
        &self,
        mut listener: Listener,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ProxyError> {
        info!("reverse proxy: listening on {}", listener.describe());
        loop {
            let (conn, peer) = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("reverse proxy: shutting down {}", listener.describe());
                    return Ok(());
                }
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("reverse proxy: accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };

            let proxy = self.clone();
            tokio::spawn(async move {
                match proxy.serve_connection(conn).await {
                    Ok(()) => debug!("reverse proxy: connection from {} finished", peer),
                    Err(ProxyError::Io(e)) if is_benign_disconnect(&e) => {
                        debug!("reverse proxy: {} disconnected: {}", peer, e)
                    }
                    Err(e) => error!("reverse proxy: connection from {}: {}", peer, e),
                }
            });
        }
    }

    /// Serve a sequence of requests on one client connection
    pub async fn serve_connection(&self, stream: BoxedStream) -> Result<(), ProxyError> {
        let mut client = BufReader::new(stream);
        loop {
            let request = match RequestHead::read(&mut client).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e @ ProxyError::Io(_)) => return Err(e),
                Err(e) => {
                    send_error(&mut client, 400, &e.to_string()).await?;
                    return Err(e);
                }
            };
            debug!("reverse proxy: {} {}", request.method, request.target);

            match self.forward(&mut client, request).await? {
                Next::KeepAlive => continue,
                Next::Close => {
                    let _ = client.get_mut().shutdown().await;
                    return Ok(());
                }
                Next::Upgraded => return Ok(()),
            }
        }
    }

    async fn forward(&self, client: &mut Client, mut request: RequestHead) -> Result<Next, ProxyError> {
        let client_close = request.wants_close();
        let request_body = match request.body_kind() {
            Ok(kind) => kind,
            Err(e) => return reject(client, 400, &e.to_string()).await,
        };

        request.headers.set("Host", HOST_HEADER_VALUE);
        if let Some(director) = &self.director {
            director(&mut request);
        }

        let backend = match self.dialer.dial().await {
            Ok(backend) => backend,
            Err(e) => {
                let msg = format!("failed to connect to the backend: {}", e);
                return reject(client, 502, &msg).await;
            }
        };
        let mut backend = BufReader::new(backend);

        if let Err(e) = write_request(&request, request_body, client, &mut backend).await {
            let msg = format!("failed to forward the request to the backend: {}", e);
            return reject(client, 502, &msg).await;
        }

        let mut response = loop {
            let response = match ResponseHead::read(&mut backend).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    let msg = "failed to read the response from the backend: connection closed";
                    return reject(client, 502, msg).await;
                }
                Err(e) => {
                    let msg = format!("failed to read the response from the backend: {}", e);
                    return reject(client, 502, &msg).await;
                }
            };

            // Pass interim responses (100 Continue) straight through
            if response.is_informational() && response.status != 101 {
                client.get_mut().write_all(&response.to_bytes()).await?;
                client.get_mut().flush().await?;
                continue;
            }
            break response;
        };

        if let Some(modify) = &self.modify_response {
            if let Err(e) = modify(&mut response) {
                let msg = format!("failed to modify the response from the backend: {}", e);
                return reject(client, 500, &msg).await;
            }
        }

        let response_body = match response.body_kind(&request.method) {
            Ok(kind) => kind,
            Err(e) => {
                let msg = format!("failed to read the response from the backend: {}", e);
                return reject(client, 502, &msg).await;
            }
        };

        // Headers are committed from here on; later failures are only logged
        client.get_mut().write_all(&response.to_bytes()).await?;
        client.get_mut().flush().await?;

        if response.status == 101 {
            upgrade(client, backend).await;
            return Ok(Next::Upgraded);
        }

        let writer = FlushedWriter::new(client.get_mut());
        let streamed = async {
            let mut out = &writer;
            copy_body(response_body, &mut backend, &mut out).await?;
            out.flush().await
        };
        let result = tokio::select! {
            res = streamed => res,
            res = writer.run_flusher(self.flush_interval) => res,
        };
        if let Err(e) = result {
            if !is_benign_disconnect(&e) {
                error!("reverse proxy: failed to stream the response body to the client: {}", e);
            }
            return Ok(Next::Close);
        }

        if client_close || response.wants_close() || response_body == BodyKind::UntilClose {
            Ok(Next::Close)
        } else {
            Ok(Next::KeepAlive)
        }
    }
}

async fn write_request(
    request: &RequestHead,
    body: BodyKind,
    client: &mut Client,
    backend: &mut BufReader<BoxedStream>,
) -> io::Result<()> {
    let out = backend.get_mut();
    out.write_all(&request.to_bytes()).await?;
    copy_body(body, client, out).await?;
    out.flush().await
}

/// Hand both connections over to a raw pipe.
///
/// Bytes either side already buffered are forwarded first.
async fn upgrade(client: &mut Client, mut backend: BufReader<BoxedStream>) {
    let from_client = client.buffer().to_vec();
    client.consume(from_client.len());
    let from_backend = backend.buffer().to_vec();
    backend.consume(from_backend.len());

    let client = client.get_mut();
    let backend = backend.get_mut();

    if !from_client.is_empty() {
        if let Err(e) = backend.write_all(&from_client).await {
            error!("reverse proxy: failed to write buffered data to the backend: {}", e);
            return;
        }
    }
    if !from_backend.is_empty() {
        if let Err(e) = client.write_all(&from_backend).await {
            error!("reverse proxy: failed to write buffered data to the client: {}", e);
            return;
        }
    }

    match pipe(client, backend).await {
        Ok(()) => debug!("reverse proxy: upgraded connection finished"),
        Err(e) if is_benign_disconnect(&e) => {
            debug!("reverse proxy: upgraded connection closed: {}", e)
        }
        Err(e) => error!("reverse proxy: piping client to backend failed: {}", e),
    }
}

/// Answer with an error status before anything was committed, then close
async fn reject(client: &mut Client, status: u16, msg: &str) -> Result<Next, ProxyError> {
    error!("reverse proxy: {}", msg);
    send_error(client, status, msg).await?;
    Ok(Next::Close)
}

async fn send_error(client: &mut Client, status: u16, msg: &str) -> io::Result<()> {
    let body = format!("{}\n", msg);
    let mut head = ResponseHead::new(status);
    head.headers.add("Content-Type", "text/plain; charset=utf-8");
    head.headers.add("X-Content-Type-Options", "nosniff");
    head.headers.add("Content-Length", body.len().to_string());
    head.headers.add("Connection", "close");

    let out = client.get_mut();
    out.write_all(&head.to_bytes()).await?;
    out.write_all(body.as_bytes()).await?;
    out.flush().await
}
