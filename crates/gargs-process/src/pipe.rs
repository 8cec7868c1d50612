//! Bounded in-process byte pipe for the per-command callback.
//!
//! When a callback is configured, capture reads the callback's derived
//! stream instead of the child's stdout. The pipe sits between them with OS
//! pipe semantics:
//!
//! ```text
//!   callback ──▶ PipeWriter ──▶ [ring buffer] ──▶ PipeReader ──▶ capture
//!                ├── writer waits when the buffer is full (backpressure)
//!                ├── reader waits when the buffer is empty
//!                ├── drop writer → EOF (reader sees 0 bytes)
//!                └── drop reader → BrokenPipe on the next write
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Pipe capacity. Matches the default size of a Linux kernel pipe buffer.
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl PipeState {
    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// Writing end of the pipe. Owned by the callback; dropping it (or calling
/// `shutdown`) signals end of the derived stream.
pub struct PipeWriter {
    state: Arc<Mutex<PipeState>>,
}

/// Reading end of the pipe, consumed by the capture stage.
pub struct PipeReader {
    state: Arc<Mutex<PipeState>>,
}

/// Create a connected pipe pair with the given capacity.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let state = Arc::new(Mutex::new(PipeState {
        buf: VecDeque::with_capacity(capacity.min(8192)),
        capacity: capacity.max(1),
        writer_closed: false,
        reader_closed: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        PipeWriter {
            state: state.clone(),
        },
        PipeReader { state },
    )
}

// The lock is only held inside poll functions, never across an await, so a
// poisoned mutex can only mean a panic mid-poll; the byte queue itself is
// still consistent.
fn lock(state: &Mutex<PipeState>) -> MutexGuard<'_, PipeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut st = lock(&self.state);
        if st.reader_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader closed",
            )));
        }
        let free = st.capacity.saturating_sub(st.buf.len());
        if free == 0 {
            st.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.len().min(free);
        st.buf.extend(&buf[..n]);
        st.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut st = lock(&self.state);
        st.writer_closed = true;
        st.wake_reader();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        st.writer_closed = true;
        st.wake_reader();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut st = lock(&self.state);
        if !st.buf.is_empty() {
            let n = buf.remaining().min(st.buf.len());
            let (front, back) = st.buf.as_slices();
            if n <= front.len() {
                buf.put_slice(&front[..n]);
            } else {
                buf.put_slice(front);
                buf.put_slice(&back[..n - front.len()]);
            }
            st.buf.drain(..n);
            st.wake_writer();
            Poll::Ready(Ok(()))
        } else if st.writer_closed {
            // EOF
            Poll::Ready(Ok(()))
        } else {
            st.read_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        st.reader_closed = true;
        st.wake_writer();
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader").finish()
    }
}
