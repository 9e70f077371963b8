//! Minimal HTTP/1.x message heads and body framing
//!
//! Only what a byte-faithful reverse proxy needs: heads are parsed so they
//! can be rewritten, bodies are relayed with their framing intact.

use super::ProxyError;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request or response head accepted (64 KB)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with `value`
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(first) => {
                self.0[first].1 = value;
                let mut index = 0;
                self.0.retain(|(k, _)| {
                    index += 1;
                    index - 1 == first || !k.eq_ignore_ascii_case(name)
                });
            }
            None => self.add(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Whether a comma separated header (`Connection`, `Transfer-Encoding`) lists `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.0 {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Runs until the sender closes the connection
    UntilClose,
}

/// Request line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (usually origin-form, `/path?query`)
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Read the next request head; `None` if the connection closed cleanly first
    pub async fn read<R>(reader: &mut R) -> Result<Option<Self>, ProxyError>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some((request_line, headers)) = read_head(reader).await? else {
            return Ok(None);
        };

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP/1.") {
            return Err(ProxyError::Malformed(format!(
                "invalid request line: {:?}",
                request_line
            )));
        }

        Ok(Some(Self {
            method: parts[0].to_string(),
            target: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
        }))
    }

    pub fn body_kind(&self) -> Result<BodyKind, ProxyError> {
        if is_chunked(&self.headers) {
            return Ok(BodyKind::Chunked);
        }
        match content_length(&self.headers)? {
            Some(0) | None => Ok(BodyKind::Empty),
            Some(n) => Ok(BodyKind::Length(n)),
        }
    }

    /// Whether the client expects the connection to close after this exchange
    pub fn wants_close(&self) -> bool {
        wants_close(&self.version, &self.headers)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version).into_bytes();
        self.headers.write_into(&mut out);
        out
    }
}

/// Status line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: status_text(status).to_string(),
            headers: Headers::new(),
        }
    }

    /// Read a response head; `None` if the connection closed before any byte
    pub async fn read<R>(reader: &mut R) -> Result<Option<Self>, ProxyError>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some((status_line, headers)) = read_head(reader).await? else {
            return Ok(None);
        };

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts.next().and_then(|s| s.parse::<u16>().ok());
        let reason = parts.next().unwrap_or_default();

        match status {
            Some(status) if version.starts_with("HTTP/1.") && (100..1000).contains(&status) => {
                Ok(Some(Self {
                    version: version.to_string(),
                    status,
                    reason: reason.to_string(),
                    headers,
                }))
            }
            _ => Err(ProxyError::Malformed(format!(
                "invalid status line: {:?}",
                status_line
            ))),
        }
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Body framing of this response to a `method` request
    pub fn body_kind(&self, method: &str) -> Result<BodyKind, ProxyError> {
        if method.eq_ignore_ascii_case("HEAD")
            || self.is_informational()
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyKind::Empty);
        }
        if is_chunked(&self.headers) {
            return Ok(BodyKind::Chunked);
        }
        match content_length(&self.headers)? {
            Some(0) => Ok(BodyKind::Empty),
            Some(n) => Ok(BodyKind::Length(n)),
            None => Ok(BodyKind::UntilClose),
        }
    }

    pub fn wants_close(&self) -> bool {
        wants_close(&self.version, &self.headers)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason).into_bytes();
        self.headers.write_into(&mut out);
        out
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

fn wants_close(version: &str, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return true;
    }
    version == "HTTP/1.0" && !headers.has_token("Connection", "keep-alive")
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("Transfer-Encoding")
        .flat_map(|v| v.split(','))
        .last()
        .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &Headers) -> Result<Option<u64>, ProxyError> {
    match headers.get("Content-Length") {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProxyError::Malformed(format!("invalid Content-Length: {:?}", v))),
    }
}

/// Read one CRLF terminated line, charging its length against `budget`.
///
/// Returns `None` at EOF before any byte.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if n >= *budget {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    *budget -= n;

    let line = String::from_utf8(line)
        .map_err(|_| ProxyError::Malformed("head is not valid UTF-8".to_string()))?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn read_head<R>(reader: &mut R) -> Result<Option<(String, Headers)>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_SIZE;

    // Tolerate empty lines before the start line
    let start_line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut headers = Headers::new();
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| ProxyError::from(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        if line.is_empty() {
            break;
        }

        match line.split_once(':') {
            Some((key, value)) if !key.is_empty() && !key.ends_with(' ') => {
                headers.add(key, value.trim());
            }
            _ => {
                return Err(ProxyError::Malformed(format!(
                    "invalid header line: {:?}",
                    line
                )))
            }
        }
    }

    Ok(Some((start_line, headers)))
}

/// Relay one body from `reader` to `writer`, keeping its framing.
///
/// Returns the number of bytes written.
pub async fn copy_body<R, W>(kind: BodyKind, reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match kind {
        BodyKind::Empty => Ok(0),
        BodyKind::Length(len) => copy_exact(reader, writer, len).await,
        BodyKind::UntilClose => tokio::io::copy_buf(reader, writer).await,
        BodyKind::Chunked => copy_chunked(reader, writer).await,
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = (&mut *reader).take(len);
    let copied = tokio::io::copy_buf(&mut limited, writer).await?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {} bytes", copied, len),
        ));
    }
    Ok(copied)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0;
    loop {
        let mut size_line = Vec::new();
        if reader.read_until(b'\n', &mut size_line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        writer.write_all(&size_line).await?;
        total += size_line.len() as u64;

        let text = String::from_utf8_lossy(&size_line);
        let size = text.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid chunk size: {:?}", size),
            )
        })?;

        if size == 0 {
            // Trailers up to and including the final empty line
            loop {
                let mut line = Vec::new();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                writer.write_all(&line).await?;
                total += line.len() as u64;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(total);
                }
            }
        }

        // Chunk data plus its CRLF
        total += copy_exact(reader, writer, size + 2).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_request_head() {
        let raw = b"\r\nGET /containers/json?all=1 HTTP/1.1\r\nHost: localhost\r\nX-Multi: a\r\nx-multi: b\r\n\r\nrest";
        let mut reader = BufReader::new(&raw[..]);

        let head = RequestHead::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/containers/json?all=1");
        assert_eq!(head.headers.get("host"), Some("localhost"));
        assert_eq!(head.headers.get_all("X-MULTI").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(head.body_kind().unwrap(), BodyKind::Empty);
        assert!(!head.wants_close());

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "rest");
    }

    #[tokio::test]
    async fn test_read_head_eof_and_garbage() {
        let mut empty = BufReader::new(&b""[..]);
        assert!(RequestHead::read(&mut empty).await.unwrap().is_none());

        let mut garbage = BufReader::new(&b"HELLO\r\n\r\n"[..]);
        assert!(matches!(
            RequestHead::read(&mut garbage).await,
            Err(ProxyError::Malformed(_))
        ));

        let mut truncated = BufReader::new(&b"HTTP/1.1 200 OK\r\nContent-"[..]);
        assert!(ResponseHead::read(&mut truncated).await.is_err());

        let huge = format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "a".repeat(MAX_HEAD_SIZE));
        let mut reader = BufReader::new(huge.as_bytes());
        assert!(matches!(
            RequestHead::read(&mut reader).await,
            Err(ProxyError::HeadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_response_body_kinds() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n";
        let head = ResponseHead::read(&mut BufReader::new(&raw[..]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.body_kind("GET").unwrap(), BodyKind::Chunked);
        assert_eq!(head.body_kind("HEAD").unwrap(), BodyKind::Empty);

        let raw = b"HTTP/1.0 200\r\n\r\n";
        let head = ResponseHead::read(&mut BufReader::new(&raw[..]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.reason, "");
        assert_eq!(head.body_kind("GET").unwrap(), BodyKind::UntilClose);
        assert!(head.wants_close());

        let mut head = ResponseHead::new(204);
        head.headers.add("Content-Length", "10");
        assert_eq!(head.body_kind("GET").unwrap(), BodyKind::Empty);
    }

    #[test]
    fn test_headers_set_replaces_all() {
        let mut headers = Headers::new();
        headers.add("Host", "a");
        headers.add("Accept", "*/*");
        headers.add("host", "b");
        headers.set("HOST", "api.moby.localhost");

        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![("Host", "api.moby.localhost"), ("Accept", "*/*")]
        );
        assert!(!headers.has_token("Connection", "close"));
        headers.add("Connection", "Upgrade, close");
        assert!(headers.has_token("connection", "close"));
    }

    #[tokio::test]
    async fn test_copy_chunked_keeps_framing() {
        let body = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nTrailer: x\r\n\r\nNEXT";
        let mut reader = BufReader::new(&body[..]);
        let mut out = Vec::new();

        let n = copy_body(BodyKind::Chunked, &mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, &body[..body.len() - 4]);
        assert_eq!(n as usize, out.len());
    }

    #[tokio::test]
    async fn test_copy_length_stops_at_boundary() {
        let mut reader = BufReader::new(&b"helloworld"[..]);
        let mut out = Vec::new();
        copy_body(BodyKind::Length(5), &mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");

        let mut short = BufReader::new(&b"abc"[..]);
        let err = copy_body(BodyKind::Length(5), &mut short, &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
