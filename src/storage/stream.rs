//! Buffered input stream over storage descriptors
//!
//! Presents the bytes addressed by an ordered list of descriptors, possibly
//! spread over several channels, as one sequential stream. Descriptors are
//! split into chunks of at most one pooled buffer; up to `read_ahead` chunks
//! are being read while the consumer works on the current one.
//!
//! ```text
//! descriptors: [c1 0..100][c4 40..300][c1 100..120]
//! chunks:      [  100   ][256][44 ][ 20 ]      (buffer size 256)
//! in flight:        ^current  ^read ahead ^read ahead
//! ```

use crate::index::StorageDescriptor;
use crate::storage::buffer_pool::{BufferPool, PooledBuffer};
use crate::storage::channel::{ChannelManager, TransferHandle, TransferOutcome};
use crate::storage::{StorageError, StorageResult};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct Chunk {
    channel_id: u32,
    position: u64,
    size: u64,
}

/// Sequential reader over descriptor ranges
///
/// Dropping the stream without [`close`](Self::close) still returns every
/// buffer once its transfer finishes; `close` additionally waits for that.
#[derive(Debug)]
pub struct DescriptorInputStream {
    channels: ChannelManager,
    pool: BufferPool,
    pending: VecDeque<Chunk>,
    in_flight: VecDeque<TransferHandle>,
    current: Option<PooledBuffer>,
    offset: usize,
    read_ahead: usize,
    remaining: u64,
    closed: bool,
}

impl DescriptorInputStream {
    /// Create a stream. `read_ahead` is clamped to `[1, pool capacity]`.
    pub fn new(
        channels: ChannelManager,
        pool: BufferPool,
        descriptors: &[StorageDescriptor],
        read_ahead: usize,
    ) -> Self {
        let chunk_size = pool.buffer_size().max(1) as u64;
        let mut pending = VecDeque::new();
        let mut remaining = 0;

        for descriptor in descriptors.iter().filter(|d| d.size > 0) {
            remaining += descriptor.size;
            let mut position = descriptor.position;
            let end = descriptor.end();
            while position < end {
                let size = chunk_size.min(end - position);
                pending.push_back(Chunk {
                    channel_id: descriptor.channel_id,
                    position,
                    size,
                });
                position += size;
            }
        }

        let read_ahead = read_ahead.clamp(1, pool.capacity().max(1));
        tracing::debug!(
            "Opened descriptor stream: {} chunks, {} bytes, read ahead {}",
            pending.len(),
            remaining,
            read_ahead
        );

        Self {
            channels,
            pool,
            pending,
            in_flight: VecDeque::new(),
            current: None,
            offset: 0,
            read_ahead,
            remaining,
            closed: false,
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn read_ahead(&self) -> usize {
        self.read_ahead
    }

    /// Issue reads until `read_ahead` chunks are in flight
    ///
    /// Only the first buffer is waited for; further read-ahead takes what is
    /// free right now so the consumer is never starved by its own prefetch.
    async fn issue(&mut self) -> StorageResult<()> {
        while self.in_flight.len() < self.read_ahead {
            let Some(chunk) = self.pending.front().copied() else {
                break;
            };
            let buffer = if self.in_flight.is_empty() {
                self.pool.acquire().await?
            } else {
                match self.pool.try_acquire() {
                    Some(buffer) => buffer,
                    None => break,
                }
            };
            self.pending.pop_front();
            self.in_flight.push_back(self.channels.read(
                chunk.channel_id,
                chunk.position,
                chunk.size,
                buffer,
            ));
        }
        Ok(())
    }

    /// Make the next chunk current. Returns `false` at the end of the stream.
    async fn advance(&mut self) -> StorageResult<bool> {
        // Give the consumed buffer back before asking for more
        self.current = None;
        self.offset = 0;

        self.issue().await?;
        let Some(handle) = self.in_flight.pop_front() else {
            return Ok(false);
        };

        let mut completion = handle.wait().await;
        match completion.outcome {
            TransferOutcome::Completed { .. } => {
                self.current = completion.buffers.pop();
                Ok(true)
            }
            TransferOutcome::Failed { error } => Err(StorageError::Transfer {
                channel_id: completion.channel_id,
                message: error,
            }),
        }
    }

    /// Read into `out`, returning the number of bytes copied (0 at the end)
    pub async fn read(&mut self, out: &mut [u8]) -> StorageResult<usize> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(current) = &self.current {
                let available = current.len() - self.offset;
                if available > 0 {
                    let count = available.min(out.len());
                    out[..count].copy_from_slice(&current[self.offset..self.offset + count]);
                    self.offset += count;
                    self.remaining -= count as u64;
                    return Ok(count);
                }
            }
            if !self.advance().await? {
                return Ok(0);
            }
        }
    }

    /// Fill `out` completely
    pub async fn read_exact(&mut self, out: &mut [u8]) -> StorageResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            let count = self.read(&mut out[filled..]).await?;
            if count == 0 {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "descriptor stream ended early",
                )));
            }
            filled += count;
        }
        Ok(())
    }

    /// Read everything that is left
    pub async fn read_to_end(&mut self) -> StorageResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.remaining as usize];
        self.read_exact(&mut bytes).await?;
        Ok(bytes)
    }

    /// Stop reading, wait for outstanding transfers and release all buffers
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        self.pending.clear();
        while let Some(handle) = self.in_flight.pop_front() {
            drop(handle.wait().await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn write(
        channels: &ChannelManager,
        pool: &BufferPool,
        channel_id: u32,
        bytes: &[u8],
    ) -> StorageDescriptor {
        let mut buffers = Vec::new();
        for chunk in bytes.chunks(pool.buffer_size()) {
            let mut buffer = pool.acquire().await.unwrap();
            buffer.fill_from(chunk);
            buffers.push(buffer);
        }
        match channels.write(channel_id, buffers).wait().await.outcome {
            TransferOutcome::Completed { position, size } => {
                StorageDescriptor::new(channel_id, position, size)
            }
            other => panic!("write failed: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_spans_channels() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(4, 8);
        let channels = ChannelManager::new(dir.path());

        let a = write(&channels, &pool, 1, b"first record").await;
        let b = write(&channels, &pool, 2, b"second").await;
        let c = write(&channels, &pool, 1, b"third one").await;

        let mut stream = DescriptorInputStream::new(channels.clone(), pool.clone(), &[a, b, c], 2);
        assert_eq!(stream.remaining(), 27);

        let bytes = stream.read_to_end().await.unwrap();
        assert_eq!(&bytes[..], b"first recordsecondthird one");
        assert_eq!(stream.remaining(), 0);
        assert_eq!(stream.read(&mut [0u8; 4]).await.unwrap(), 0);

        stream.close().await;
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_read_exact_per_descriptor() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(3, 4);
        let channels = ChannelManager::new(dir.path());

        let a = write(&channels, &pool, 1, b"abcdefghij").await;
        let b = write(&channels, &pool, 1, b"xyz").await;

        let mut stream = DescriptorInputStream::new(channels, pool.clone(), &[a, b], 3);
        let mut first = vec![0u8; a.size as usize];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first[..], b"abcdefghij");

        let mut second = vec![0u8; 3];
        stream.read_exact(&mut second).await.unwrap();
        assert_eq!(&second[..], b"xyz");

        let mut extra = [0u8; 1];
        assert!(stream.read_exact(&mut extra).await.is_err());
    }

    #[tokio::test]
    async fn test_close_mid_stream_releases_buffers() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(4, 16);
        let channels = ChannelManager::new(dir.path());

        let a = write(&channels, &pool, 1, &[7u8; 64]).await;

        let mut stream = DescriptorInputStream::new(channels, pool.clone(), &[a], 4);
        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await.unwrap();
        assert!(pool.available() < 4);

        stream.close().await;
        assert_eq!(pool.available(), 4);
        assert!(matches!(stream.read(&mut head).await, Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_transfer_surfaces() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(2, 16);
        let channels = ChannelManager::new(dir.path());

        let missing = StorageDescriptor::new(9, 0, 10);
        let mut stream = DescriptorInputStream::new(channels, pool.clone(), &[missing], 1);
        let err = stream.read_to_end().await.unwrap_err();
        assert!(matches!(err, StorageError::Transfer { channel_id: 9, .. }));

        stream.close().await;
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_read_ahead_clamped_and_empty_skipped() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(2, 16);
        let channels = ChannelManager::new(dir.path());

        let stream = DescriptorInputStream::new(
            channels.clone(),
            pool.clone(),
            &[StorageDescriptor::unset(1)],
            10,
        );
        assert_eq!(stream.read_ahead(), 2);
        assert_eq!(stream.remaining(), 0);

        let stream = DescriptorInputStream::new(channels, pool, &[], 0);
        assert_eq!(stream.read_ahead(), 1);
    }
}
