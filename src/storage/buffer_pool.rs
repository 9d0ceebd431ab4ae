//! Buffer pool
//!
//! A fixed number of fixed-capacity byte buffers shared by every read and
//! write transfer. Acquiring suspends while all buffers are checked out, which
//! bounds the memory and the number of transfers in flight. Buffers go back
//! to the pool when the [`PooledBuffer`] is dropped.

use crate::storage::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

struct PoolInner {
    buffer_size: usize,
    capacity: usize,
    /// One permit per free buffer
    permits: Semaphore,
    /// Free buffers, all preallocated
    free: Mutex<Vec<Vec<u8>>>,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

impl PoolInner {
    fn checkout(self: &Arc<Self>, count: usize) -> Vec<PooledBuffer> {
        let mut buffers = Vec::with_capacity(count);
        {
            let mut free = self.free.lock();
            for _ in 0..count {
                let data = free
                    .pop()
                    .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
                buffers.push(PooledBuffer {
                    data,
                    pool: Arc::clone(self),
                });
            }
        }
        let now = self.in_use.fetch_add(count, Ordering::AcqRel) + count;
        self.peak_in_use.fetch_max(now, Ordering::AcqRel);
        buffers
    }

    fn give_back(&self, mut data: Vec<u8>) {
        data.clear();
        self.free.lock().push(data);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.permits.add_permits(1);
    }
}

/// Bounded pool of reusable byte buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("buffer_size", &self.inner.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool of `capacity` buffers holding `buffer_size` bytes each
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Vec::with_capacity(buffer_size))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                capacity,
                permits: Semaphore::new(capacity),
                free: Mutex::new(free),
                in_use: AtomicUsize::new(0),
                peak_in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take one buffer, waiting until one is free
    pub async fn acquire(&self) -> StorageResult<PooledBuffer> {
        let mut buffers = self.acquire_many(1).await?;
        buffers.pop().ok_or(StorageError::PoolClosed)
    }

    /// Take `count` buffers at once
    ///
    /// The buffers are granted together, so two callers asking for several
    /// buffers can not deadlock each other holding partial sets.
    pub async fn acquire_many(&self, count: usize) -> StorageResult<Vec<PooledBuffer>> {
        if count > self.inner.capacity {
            return Err(StorageError::BufferRequest {
                requested: count,
                capacity: self.inner.capacity,
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let permit = self
            .inner
            .permits
            .acquire_many(count as u32)
            .await
            .map_err(|_| StorageError::PoolClosed)?;
        permit.forget();
        Ok(self.inner.checkout(count))
    }

    /// Take one buffer if one is free right now
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let permit = self.inner.permits.try_acquire().ok()?;
        permit.forget();
        self.inner.checkout(1).pop()
    }

    /// Return a buffer. Same as dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// Buffers that can be acquired without waiting
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Highest number of buffers that were checked out at once
    pub fn peak_in_use(&self) -> usize {
        self.inner.peak_in_use.load(Ordering::Acquire)
    }

    /// Fail all pending and future acquisitions
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

/// Buffer checked out of a [`BufferPool`]
///
/// Dereferences to the filled bytes. Dropping it clears the content and
/// returns it to the pool.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Maximum number of bytes the buffer holds
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.data.len()
    }

    /// Append as much of `bytes` as fits, returning the number copied
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..count]);
        count
    }

    /// Reset to `len` zeroed bytes, ready to be read into
    pub fn prepare(&mut self, len: usize) -> StorageResult<&mut [u8]> {
        if len > self.capacity() {
            return Err(StorageError::BufferRequest {
                requested: len,
                capacity: self.capacity(),
            });
        }
        self.data.clear();
        self.data.resize(len, 0);
        Ok(&mut self.data)
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.give_back(data);
    }
}
