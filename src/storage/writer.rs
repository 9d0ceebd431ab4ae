//! Storage writer
//!
//! Producer side of the write path:
//!
//! ```text
//! record → WriteTask → handler.start_write (channel id)
//!        → bincode → pooled buffers → ChannelManager::write
//!        → Completed: handler.write_successful(position, size)
//!          Failed:    handler.write_failed
//! ```
//!
//! Records too large for the buffer pool are rejected before they are
//! indexed. Failed writes are not retried here; the error is returned to the
//! caller. A write whose future is dropped midway is reported as failed.

use crate::index::{IndexedData, StorageDescriptor};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::channel::{ChannelManager, TransferOutcome};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree_handler::IndexingTreeHandler;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Unit of work tracked by the tree handler
pub trait WriteTask: Send + Sync {
    /// Identity of the task while it is in flight
    fn task_id(&self) -> u64;

    /// Data to index, if any
    fn data(&self) -> Option<&dyn IndexedData>;
}

/// Write task carrying one record
#[derive(Debug)]
pub struct RecordWriteTask<R> {
    id: u64,
    record: Option<Arc<R>>,
}

impl<R> RecordWriteTask<R> {
    pub fn new(id: u64, record: Arc<R>) -> Self {
        Self {
            id,
            record: Some(record),
        }
    }

    /// Task without data, rejected by the handler
    pub fn empty(id: u64) -> Self {
        Self { id, record: None }
    }
}

impl<R: IndexedData + 'static> WriteTask for RecordWriteTask<R> {
    fn task_id(&self) -> u64 {
        self.id
    }

    fn data(&self) -> Option<&dyn IndexedData> {
        self.record.as_deref().map(|r| r as &dyn IndexedData)
    }
}

/// Counts a running write for its whole lifetime
struct ActiveWrite<'a> {
    active: &'a AtomicUsize,
    idle: &'a Notify,
}

impl<'a> ActiveWrite<'a> {
    fn new(active: &'a AtomicUsize, idle: &'a Notify) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self { active, idle }
    }
}

impl Drop for ActiveWrite<'_> {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Reports a started task as failed unless completed
struct PendingTask<'a> {
    handler: &'a IndexingTreeHandler,
    task: &'a dyn WriteTask,
    armed: bool,
}

impl<'a> PendingTask<'a> {
    fn new(handler: &'a IndexingTreeHandler, task: &'a dyn WriteTask) -> Self {
        Self {
            handler,
            task,
            armed: true,
        }
    }

    fn complete(mut self, position: u64, size: u64) {
        self.armed = false;
        self.handler.write_successful(self.task, position, size);
    }
}

impl Drop for PendingTask<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.handler.write_failed(self.task);
        }
    }
}

/// Serializes records and writes them to their channels
pub struct StorageWriter {
    handler: Arc<IndexingTreeHandler>,
    channels: ChannelManager,
    pool: BufferPool,
    next_task_id: AtomicU64,
    active: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("queued", &self.queued_task_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl StorageWriter {
    pub fn new(handler: Arc<IndexingTreeHandler>, channels: ChannelManager, pool: BufferPool) -> Self {
        Self {
            handler,
            channels,
            pool,
            next_task_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Largest encoded record the pool can carry
    pub fn record_limit(&self) -> usize {
        self.pool.capacity() * self.pool.buffer_size()
    }

    /// Index and write one record, returning its final descriptor
    pub async fn write<R>(&self, record: Arc<R>) -> StorageResult<StorageDescriptor>
    where
        R: IndexedData + Serialize + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let _active = ActiveWrite::new(&self.active, &self.idle);

        // Size is checked before indexing so a rejected record keeps its id free
        let bytes = bincode::serialize(record.as_ref())?;
        let buffer_count = self.buffers_needed(bytes.len())?;

        let task_id = self.next_task_id.fetch_add(1, Ordering::AcqRel);
        let task = RecordWriteTask::new(task_id, Arc::clone(&record));
        let channel_id = self.handler.start_write(&task)?;
        let pending = PendingTask::new(self.handler.as_ref(), &task);

        match self.transfer(channel_id, &bytes, buffer_count).await {
            Ok((position, size)) => {
                pending.complete(position, size);
                Ok(StorageDescriptor::new(channel_id, position, size))
            }
            Err(e) => {
                tracing::warn!("Write of record {} failed: {}", record.id(), e);
                drop(pending);
                Err(e)
            }
        }
    }

    fn buffers_needed(&self, len: usize) -> StorageResult<usize> {
        let needed = len.div_ceil(self.pool.buffer_size().max(1)).max(1);
        if needed > self.pool.capacity() {
            return Err(StorageError::RecordTooLarge {
                size: len,
                limit: self.record_limit(),
            });
        }
        Ok(needed)
    }

    async fn transfer(
        &self,
        channel_id: u32,
        bytes: &[u8],
        buffer_count: usize,
    ) -> StorageResult<(u64, u64)> {
        let mut buffers = self.pool.acquire_many(buffer_count).await?;
        for (buffer, chunk) in buffers.iter_mut().zip(bytes.chunks(self.pool.buffer_size().max(1))) {
            buffer.fill_from(chunk);
        }

        let completion = self.channels.write(channel_id, buffers).wait().await;
        match completion.outcome {
            TransferOutcome::Completed { position, size } => Ok((position, size)),
            TransferOutcome::Failed { error } => Err(StorageError::Transfer {
                channel_id,
                message: error,
            }),
        }
    }

    /// Write several records concurrently, one result per record in order
    pub async fn write_batch<R>(&self, records: Vec<Arc<R>>) -> Vec<StorageResult<StorageDescriptor>>
    where
        R: IndexedData + Serialize + 'static,
    {
        join_all(records.into_iter().map(|record| self.write(record))).await
    }

    /// Writes currently between start and completion
    pub fn queued_task_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reject new writes and wait for running ones
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let idle = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }
    }
}
