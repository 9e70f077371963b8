//! Buffered writer flushed on a timer

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

/// How often streamed response bodies are pushed to the client
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

struct State<W> {
    writer: BufWriter<W>,
    dirty: bool,
}

/// Buffers writes and lets [`FlushedWriter::run_flusher`] push them out
/// periodically, so long-lived streams (`docker logs -f`) reach the client
/// without waiting for the buffer to fill.
///
/// Writes go through `&FlushedWriter`. The writer and the flusher must be
/// polled from the same task (e.g. one `select!`), because both drive the
/// same underlying stream.
pub struct FlushedWriter<W> {
    state: Mutex<State<W>>,
}

impl<W: AsyncWrite + Unpin> FlushedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(State {
                writer: BufWriter::new(writer),
                dirty: false,
            }),
        }
    }

    /// Whether data was written since the last flush
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Flush every `interval`, skipping ticks with nothing new.
    ///
    /// Only returns if a flush fails. A zero interval is treated as 1 ms.
    pub async fn run_flusher(&self, interval: Duration) -> io::Result<()> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_dirty() {
                let mut writer = self;
                writer.flush().await?;
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.state.into_inner().writer.into_inner()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for &FlushedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        let res = Pin::new(&mut state.writer).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                state.dirty = true;
            }
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        let res = Pin::new(&mut state.writer).poll_flush(cx);
        if let Poll::Ready(Ok(())) = res {
            state.dirty = false;
        }
        res
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        Pin::new(&mut state.writer).poll_shutdown(cx)
    }
}
