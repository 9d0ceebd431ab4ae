//! Channel I/O
//!
//! Every indexing leaf writes to its own channel file `<dir>/<id>.itdata`.
//! Transfers run on spawned tasks and report back through a
//! [`TransferHandle`]; the completion carries a tagged [`TransferOutcome`]
//! and hands the pooled buffers back to the issuer. I/O errors never escape
//! as `Err`, they become a failed outcome.
//!
//! # Layout
//!
//! ```text
//! channel 7:  [record a][record b][record c] ...   (append only)
//!              ^pos 0    ^pos |a|  ^pos |a|+|b|
//! ```

use crate::storage::buffer_pool::PooledBuffer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// File extension of channel files
pub const CHANNEL_FILE_EXT: &str = "itdata";

/// Result of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Bytes `[position, position + size)` were transferred
    Completed { position: u64, size: u64 },
    Failed { error: String },
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. })
    }
}

/// Completion of a transfer, returning the buffers it used
#[derive(Debug)]
pub struct TransferCompletion {
    pub channel_id: u32,
    pub outcome: TransferOutcome,
    pub buffers: Vec<PooledBuffer>,
}

/// Pending transfer
#[derive(Debug)]
pub struct TransferHandle {
    channel_id: u32,
    receiver: oneshot::Receiver<TransferCompletion>,
}

impl TransferHandle {
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Wait for the transfer to finish
    ///
    /// A transfer task that vanished without reporting is a failure; its
    /// buffers were dropped back into the pool with it.
    pub async fn wait(self) -> TransferCompletion {
        match self.receiver.await {
            Ok(completion) => completion,
            Err(_) => TransferCompletion {
                channel_id: self.channel_id,
                outcome: TransferOutcome::Failed {
                    error: "transfer task terminated".to_string(),
                },
                buffers: Vec::new(),
            },
        }
    }
}

#[derive(Debug)]
struct OpenChannel {
    file: File,
    /// Logical end of the channel, next write position
    length: u64,
    writable: bool,
}

struct ChannelInner {
    dir: PathBuf,
    channels: Mutex<HashMap<u32, Arc<AsyncMutex<Option<OpenChannel>>>>>,
}

/// Positioned reads and appends against channel files
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("dir", &self.inner.dir)
            .field("open_channels", &self.inner.channels.lock().len())
            .finish()
    }
}

impl ChannelManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                dir: dir.into(),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of a channel file
    pub fn channel_path(&self, channel_id: u32) -> PathBuf {
        self.inner
            .dir
            .join(format!("{}.{}", channel_id, CHANNEL_FILE_EXT))
    }

    fn slot(&self, channel_id: u32) -> Arc<AsyncMutex<Option<OpenChannel>>> {
        self.inner
            .channels
            .lock()
            .entry(channel_id)
            .or_default()
            .clone()
    }

    /// Append the content of `buffers` to a channel
    ///
    /// The position is assigned under the channel lock, so concurrent writes
    /// to one channel get disjoint ranges.
    pub fn write(&self, channel_id: u32, buffers: Vec<PooledBuffer>) -> TransferHandle {
        let (sender, receiver) = oneshot::channel();
        let slot = self.slot(channel_id);
        let path = self.channel_path(channel_id);

        tokio::spawn(async move {
            let mut guard = slot.lock().await;
            let outcome = match append(&mut guard, &path, &buffers).await {
                Ok((position, size)) => TransferOutcome::Completed { position, size },
                Err(e) => {
                    tracing::error!("Write transfer to channel {} failed: {}", channel_id, e);
                    TransferOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            drop(guard);
            let _ = sender.send(TransferCompletion {
                channel_id,
                outcome,
                buffers,
            });
        });

        TransferHandle {
            channel_id,
            receiver,
        }
    }

    /// Read `size` bytes at `position` into `buffer`
    ///
    /// Never creates the channel file.
    pub fn read(
        &self,
        channel_id: u32,
        position: u64,
        size: u64,
        mut buffer: PooledBuffer,
    ) -> TransferHandle {
        let (sender, receiver) = oneshot::channel();
        let slot = self.slot(channel_id);
        let path = self.channel_path(channel_id);

        tokio::spawn(async move {
            let mut guard = slot.lock().await;
            let outcome = match read_at(&mut guard, &path, position, size, &mut buffer).await {
                Ok(()) => TransferOutcome::Completed { position, size },
                Err(e) => {
                    tracing::error!(
                        "Read of {} bytes at {} from channel {} failed: {}",
                        size,
                        position,
                        channel_id,
                        e
                    );
                    buffer.clear();
                    TransferOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            drop(guard);
            let _ = sender.send(TransferCompletion {
                channel_id,
                outcome,
                buffers: vec![buffer],
            });
        });

        TransferHandle {
            channel_id,
            receiver,
        }
    }

    /// Logical length of an open channel
    pub async fn length(&self, channel_id: u32) -> Option<u64> {
        let slot = self.inner.channels.lock().get(&channel_id).cloned()?;
        let guard = slot.lock().await;
        guard.as_ref().map(|c| c.length)
    }

    /// Flush, sync and close one channel
    pub async fn finalize_channel(&self, channel_id: u32) -> std::io::Result<()> {
        let slot = self.inner.channels.lock().remove(&channel_id);
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            if let Some(mut channel) = guard.take() {
                if channel.writable {
                    channel.file.flush().await?;
                    channel.file.sync_all().await?;
                }
                tracing::debug!("Closed channel {} at length {}", channel_id, channel.length);
            }
        }
        Ok(())
    }

    /// Finalize every open channel
    pub async fn close_all(&self) -> std::io::Result<()> {
        let ids: Vec<u32> = self.inner.channels.lock().keys().copied().collect();
        let mut first_error = None;
        for channel_id in ids {
            if let Err(e) = self.finalize_channel(channel_id).await {
                tracing::error!("Failed to close channel {}: {}", channel_id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }
}

async fn open_for_write(path: &Path) -> std::io::Result<OpenChannel> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .await?;
    let length = file.metadata().await?.len();
    tracing::debug!("Opened channel {:?} for writing at length {}", path, length);
    Ok(OpenChannel {
        file,
        length,
        writable: true,
    })
}

async fn append(
    slot: &mut Option<OpenChannel>,
    path: &Path,
    buffers: &[PooledBuffer],
) -> std::io::Result<(u64, u64)> {
    if !slot.as_ref().map_or(false, |c| c.writable) {
        *slot = Some(open_for_write(path).await?);
    }
    let channel = slot
        .as_mut()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "channel not open"))?;

    let position = channel.length;
    channel.file.seek(SeekFrom::Start(position)).await?;
    let mut size = 0u64;
    for buffer in buffers {
        channel.file.write_all(buffer).await?;
        size += buffer.len() as u64;
    }
    channel.file.flush().await?;
    channel.length = position + size;
    Ok((position, size))
}

async fn read_at(
    slot: &mut Option<OpenChannel>,
    path: &Path,
    position: u64,
    size: u64,
    buffer: &mut PooledBuffer,
) -> std::io::Result<()> {
    if slot.is_none() {
        let file = File::open(path).await?;
        let length = file.metadata().await?.len();
        *slot = Some(OpenChannel {
            file,
            length,
            writable: false,
        });
    }
    let channel = slot
        .as_mut()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "channel not open"))?;

    if position + size > channel.length {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "range {}..{} beyond channel length {}",
                position,
                position + size,
                channel.length
            ),
        ));
    }
    let target = buffer
        .prepare(size as usize)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    channel.file.seek(SeekFrom::Start(position)).await?;
    channel.file.read_exact(target).await?;
    Ok(())
}
