//! HTTP reverse proxy
//!
//! Provides:
//! - HTTP/1 head parsing and framing-preserving body relay
//! - Periodically flushed response writer for streamed bodies
//! - Reverse proxy with protocol upgrade (101) hand-off to a raw pipe

mod flush;
mod http;
mod reverse;

pub use flush::{FlushedWriter, FLUSH_INTERVAL};
pub use http::{
    copy_body, status_text, BodyKind, Headers, RequestHead, ResponseHead, MAX_HEAD_SIZE,
};
pub use reverse::{Dialer, Director, ModifyResponse, ReverseProxy, HOST_HEADER_VALUE};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed HTTP message: {0}")]
    Malformed(String),

    #[error("HTTP head larger than {0} bytes")]
    HeadTooLarge(usize),

    #[error("{0}")]
    Hook(String),
}
