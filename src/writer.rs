//! Dedicated writer task per connection.
//!
//! Every frame bound for a socket goes through one task that owns the write
//! half, so frames never interleave and several ready frames go out in a
//! single vectored write.
//!
//! ```text
//! Caller thread 1 ─┐
//! Caller thread 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Handler task N  ─┘
//! ```
//!
//! Callers on plain threads use [`WriterHandle::send_blocking`]; tasks on the
//! runtime use [`WriterHandle::send`].

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RpcError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Poll interval while a blocking sender waits out backpressure.
const BLOCKING_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded envelope (16 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for a reply without results).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a request frame; the header length is taken from `payload`.
    #[inline]
    pub fn request(xid: i64, call_id: i32, payload: Bytes) -> Self {
        Self {
            header: Header::request(xid, call_id, payload.len() as u32).encode(),
            payload,
        }
    }

    /// Create a reply frame; the header length is taken from `payload`.
    #[inline]
    pub fn reply(xid: i64, error_code: i32, payload: Bytes) -> Self {
        Self {
            header: Header::reply(xid, error_code, payload.len() as u32).encode(),
            payload,
        }
    }

    /// Create a reply frame carrying only an error code.
    #[inline]
    pub fn error_reply(xid: i64, error_code: i32) -> Self {
        Self::reply(xid, error_code, Bytes::new())
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable. The task exits once every handle is dropped.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    /// Maximum pending frames.
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
}

impl WriterHandle {
    /// Create a new writer handle.
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task.
    ///
    /// This method will wait if backpressure is active, timing out after
    /// the configured duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        // Check backpressure
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            // Wait with timeout for backpressure to clear
            self.wait_for_backpressure().await?;
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        // Send to channel
        self.tx.send(frame).await.map_err(|_| {
            // Decrement on failure
            self.pending.fetch_sub(1, Ordering::Release);
            RpcError::ConnectionClosed
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(RpcError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Send a frame from a thread outside the runtime.
    ///
    /// Same backpressure rules as [`send`](Self::send), but parks the calling
    /// thread instead of yielding.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn send_blocking(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            let start = Instant::now();
            while self.pending.load(Ordering::Acquire) >= self.max_pending {
                if start.elapsed() > self.timeout {
                    return Err(RpcError::BackpressureTimeout);
                }
                if self.tx.is_closed() {
                    return Err(RpcError::ConnectionClosed);
                }
                std::thread::sleep(BLOCKING_CHECK_INTERVAL);
            }
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.blocking_send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RpcError::ConnectionClosed
        })
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// Must be called within a runtime context. The returned `JoinHandle`
/// resolves when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the socket.
///
/// Uses batching and scatter/gather I/O (writev) for efficiency.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                tracing::trace!("Writer channel closed");
                return Ok(());
            }
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!("Writer stopped after failed write: {}", e);
            pending.fetch_sub(batch_size, Ordering::Release);
            rx.close();
            return Err(e);
        }

        // Update pending count
        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    // Each frame contributes 1-2 slices (header, optionally payload)
    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);

    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    // Calculate total size
    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    // Fast path: whole batch in one call
    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Slow path: partial write, need to continue with remaining data
    let mut total_written = written;

    while total_written < total_size {
        // Rebuild slices for remaining data
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        // Handle header
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;

        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        // Handle payload
        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}
