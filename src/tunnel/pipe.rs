//! Half-close aware bidirectional copy

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::trace;

/// Copy bytes between `a` and `b` in both directions until both sides are done.
///
/// When one direction reaches EOF (or fails) the write side of its destination
/// is shut down, so the peer sees a FIN while the opposite direction keeps
/// draining. Returns once both directions have finished; the first failure in
/// completion order is the result. Fully closing the streams is left to the
/// caller.
pub async fn pipe<A, B>(a: &mut A, b: &mut B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let first_err: OnceCell<io::Error> = OnceCell::new();

    let forward = async {
        match copy_then_close_write(&mut a_read, &mut b_write).await {
            Ok(n) => trace!("pipe: forward direction done after {} bytes", n),
            Err(e) => {
                let _ = first_err.set(e);
            }
        }
    };
    let backward = async {
        match copy_then_close_write(&mut b_read, &mut a_write).await {
            Ok(n) => trace!("pipe: backward direction done after {} bytes", n),
            Err(e) => {
                let _ = first_err.set(e);
            }
        }
    };
    tokio::join!(forward, backward);

    match first_err.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn copy_then_close_write<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = copy(src, dst).await;
    let closed = dst.shutdown().await;
    match (copied, closed) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(n), Ok(())) => Ok(n),
    }
}

async fn copy<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; super::COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
}

/// Whether `e` only says that the other side went away
pub fn is_benign_disconnect(e: &io::Error) -> bool {
    // ERROR_BROKEN_PIPE and ERROR_NO_DATA from named pipes
    if cfg!(windows) && matches!(e.raw_os_error(), Some(109) | Some(232)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Counts write-side shutdowns of the wrapped stream
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Reads fail, writes are swallowed, shutdown fails if asked to
    struct BrokenStream {
        read_error: Option<io::ErrorKind>,
        fail_shutdown: bool,
    }

    impl AsyncRead for BrokenStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.read_error {
                Some(kind) => Poll::Ready(Err(io::Error::new(kind, "read failed"))),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    impl AsyncWrite for BrokenStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if self.fail_shutdown {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "shutdown failed")))
            } else {
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_half_close_lets_reply_through() {
        let (mut client, mut proxy_a) = duplex(1024);
        let (mut proxy_b, mut server) = duplex(1024);

        let piping = tokio::spawn(async move { pipe(&mut proxy_a, &mut proxy_b).await });

        let server_task = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            server.write_all(b"return data").await.unwrap();
            server.shutdown().await.unwrap();
            received
        });

        client.write_all(b"some data").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(server_task.await.unwrap(), b"some data");
        assert_eq!(reply, b"return data");
        piping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_destination_write_side_closed_exactly_once() {
        let (mut client, proxy_a) = duplex(1024);
        let (proxy_b, mut server) = duplex(1024);

        let a_shutdowns = Arc::new(AtomicUsize::new(0));
        let b_shutdowns = Arc::new(AtomicUsize::new(0));
        let mut a = CountingStream {
            inner: proxy_a,
            shutdowns: a_shutdowns.clone(),
        };
        let mut b = CountingStream {
            inner: proxy_b,
            shutdowns: b_shutdowns.clone(),
        };

        let piping = tokio::spawn(async move { pipe(&mut a, &mut b).await });

        client.shutdown().await.unwrap();
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();

        // The reverse direction is still open
        assert_eq!(b_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(a_shutdowns.load(Ordering::SeqCst), 0);
        assert!(!piping.is_finished());

        server.write_all(b"late reply").await.unwrap();
        server.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");

        piping.await.unwrap().unwrap();
        assert_eq!(a_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(b_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_error_is_returned_after_both_directions() {
        let mut broken = BrokenStream {
            read_error: Some(io::ErrorKind::ConnectionReset),
            fail_shutdown: false,
        };
        let (mut proxy_b, server) = duplex(1024);
        drop(server);

        let err = pipe(&mut broken, &mut proxy_b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(is_benign_disconnect(&err));
    }

    #[tokio::test]
    async fn test_close_write_error_replaces_clean_eof() {
        let mut a = BrokenStream {
            read_error: None,
            fail_shutdown: false,
        };
        let mut b = BrokenStream {
            read_error: None,
            fail_shutdown: true,
        };

        let err = pipe(&mut a, &mut b).await.unwrap_err();
        assert_eq!(err.to_string(), "shutdown failed");
        assert!(!is_benign_disconnect(&err));
    }
}
