//! Dedicated writer task, one per attendant.
//!
//! The write half of every connection is owned by a single task that receives
//! encoded frames over a bounded mpsc channel. Senders never hold a lock on
//! the socket, and frames queued back to back are flushed with one vectored
//! write.
//!
//! # Architecture
//!
//! ```text
//! send() ─┐
//! send() ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► socket write half
//! send() ─┘                              ▲
//!                      shutdown token ───┘ (shutdown write half, exit)
//! ```
//!
//! A full channel makes `send` wait: that is the outbound backpressure.
//! Frames still queued when the shutdown token fires are discarded, and a
//! write in progress is abandoned.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ConveyorError, Result};

/// Default channel capacity (frames).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Outbound frame queue capacity. Values below 1 are raised to 1.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the queue is full.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConveyorError::ConnectionClosed)
    }

    /// Whether the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task exits when `shutdown` fires or every handle is dropped, shutting
/// down the write half on the way out. A write error ends it immediately;
/// later sends then fail with [`ConveyorError::ConnectionClosed`].
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, shutdown).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "writer task failed");
        }
        result
    });

    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        // A peer that stopped reading blocks the write; the token still wins
        // and the write half is dropped with whatever is left unsent.
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            written = write_batch(&mut writer, &batch) => written?,
        }
    }

    // Peer may already be gone; a failed FIN changes nothing for us.
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ConveyorError::Io(std::io::Error::new(
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
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start_in_frame..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_writer_config_default() {
        assert_eq!(WriterConfig::default().channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) =
            spawn_writer_task(client, &WriterConfig::default(), CancellationToken::new());

        handle.send(Bytes::from_static(b"hello\n")).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[tokio::test]
    async fn test_writer_batching_preserves_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) =
            spawn_writer_task(client, &WriterConfig::default(), CancellationToken::new());

        for i in 0..10u8 {
            handle.send(Bytes::copy_from_slice(&[b'0' + i])).await.unwrap();
        }

        let mut buf = vec![0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[tokio::test]
    async fn test_shutdown_closes_write_half() {
        let (client, mut server) = duplex(4096);
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default(), shutdown.clone());

        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());

        // Peer observes end-of-stream.
        let mut buf = vec![0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            handle.send(Bytes::from_static(b"late")).await,
            Err(ConveyorError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_blocked_write() {
        // The peer never reads, so anything beyond 16 bytes stays stuck.
        let (client, server) = duplex(16);
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default(), shutdown.clone());

        handle.send(Bytes::from(vec![b'x'; 4096])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert!(handle.is_closed());
        drop(server);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) =
            spawn_writer_task(client, &WriterConfig::default(), CancellationToken::new());

        drop(handle);

        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_frame() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")];
        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"c");
        assert_eq!(&*slices[1], b"de");
    }

    #[test]
    fn test_build_remaining_slices_skip_frame() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")];
        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"de");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 15);
    }
}
