//! Indexing tree handler
//!
//! Bridges producers to the indexing tree. A write task goes through:
//!
//! ```text
//! start_write ──► tree.put ──► in flight ──┬─► write_successful (descriptor set)
//!                                          └─► write_failed     (descriptor left unset)
//! ```
//!
//! Alongside, a periodic check estimates the tree's memory footprint and,
//! once it reaches the configured maximum, saves the whole tree through the
//! [`TreeCodec`] on a blocking worker. At most one save runs at a time.
//! [`finish`](IndexingTreeHandler::finish) stops the check, waits a bounded
//! time for in-flight writes and performs one last save.

use crate::index::{DescriptorRef, IndexingTree, ObjectSizes};
use crate::storage::codec::TreeCodec;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::writer::WriteTask;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Settings of the tree handler
#[derive(Debug, Clone)]
pub struct TreeHandlerConfig {
    /// Estimated tree size (bytes) at which a save is submitted
    pub maximum_tree_size: u64,
    /// Period of the size check
    pub check_interval: Duration,
    /// Name the tree is saved under
    pub index_name: String,
    /// Pause between checks for in-flight writes during finish
    pub finish_wait: Duration,
    /// Maximum number of pauses during finish
    pub finish_wait_iterations: u32,
}

impl Default for TreeHandlerConfig {
    fn default() -> Self {
        Self {
            maximum_tree_size: 20 * 1024 * 1024,
            check_interval: Duration::from_secs(30),
            index_name: "indexing_tree".to_string(),
            finish_wait: Duration::from_millis(1000),
            finish_wait_iterations: 30,
        }
    }
}

/// Write tracking and self-persistence for one indexing tree
pub struct IndexingTreeHandler {
    tree: Arc<IndexingTree>,
    codec: Arc<dyn TreeCodec>,
    sizes: Arc<dyn ObjectSizes>,
    config: TreeHandlerConfig,
    runtime: Handle,
    /// Task id → descriptor slot awaiting its physical write
    in_flight: Mutex<HashMap<u64, DescriptorRef>>,
    save_task: Mutex<Option<JoinHandle<()>>>,
    checker: Mutex<Option<JoinHandle<()>>>,
    saves_submitted: AtomicU64,
    finished: AtomicBool,
    /// Outcome of the one final save, shared by every `finish` caller
    finish_outcome: OnceCell<Result<(), String>>,
}

impl std::fmt::Debug for IndexingTreeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingTreeHandler")
            .field("config", &self.config)
            .field("in_flight", &self.write_task_in_progress_count())
            .field("saves_submitted", &self.saves_submitted())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl IndexingTreeHandler {
    /// Create a handler. Background work is spawned on `runtime`.
    pub fn new(
        tree: Arc<IndexingTree>,
        codec: Arc<dyn TreeCodec>,
        sizes: Arc<dyn ObjectSizes>,
        config: TreeHandlerConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            tree,
            codec,
            sizes,
            config,
            runtime,
            in_flight: Mutex::new(HashMap::new()),
            save_task: Mutex::new(None),
            checker: Mutex::new(None),
            saves_submitted: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            finish_outcome: OnceCell::new(),
        }
    }

    /// Start the periodic size check
    ///
    /// The first check runs one interval after start. The loop ends when the
    /// handler is finished or dropped.
    pub fn start(self: &Arc<Self>) {
        let handler = Arc::downgrade(self);
        let period = self.config.check_interval;

        let task = self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                if handler.is_finished() {
                    break;
                }
                handler.check_tree_size();
            }
        });

        if let Some(previous) = self.checker.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn tree(&self) -> &Arc<IndexingTree> {
        &self.tree
    }

    pub fn config(&self) -> &TreeHandlerConfig {
        &self.config
    }

    // ==================== Write Tracking ====================

    /// Index the task's data and register it as in flight
    ///
    /// Returns the channel the caller must write the bytes to.
    pub fn start_write(&self, task: &dyn WriteTask) -> StorageResult<u32> {
        if self.is_finished() {
            return Err(StorageError::Closed);
        }
        let data = task.data().ok_or_else(|| {
            StorageError::Indexing("Indexing failed, the write task carries no data".to_string())
        })?;

        let descriptor = self.tree.put(data)?;
        let channel_id = descriptor.channel_id();
        if let Some(replaced) = self.in_flight.lock().insert(task.task_id(), descriptor) {
            tracing::warn!(
                "Write task {} was already in flight for channel {}",
                task.task_id(),
                replaced.channel_id()
            );
        }
        Ok(channel_id)
    }

    /// Finalize the task's descriptor. No-op for unknown tasks.
    pub fn write_successful(&self, task: &dyn WriteTask, position: u64, size: u64) {
        let descriptor = self.in_flight.lock().remove(&task.task_id());
        if let Some(descriptor) = descriptor {
            if !descriptor.finalize(position, size) {
                tracing::warn!(
                    "Descriptor of write task {} was already finalized",
                    task.task_id()
                );
            }
        }
    }

    /// Drop the task's bookkeeping, leaving its descriptor unset
    pub fn write_failed(&self, task: &dyn WriteTask) {
        if self.in_flight.lock().remove(&task.task_id()).is_some() {
            tracing::debug!("Write task {} failed", task.task_id());
        }
    }

    pub fn write_task_in_progress_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    // ==================== Self Persistence ====================

    /// Submit a save if the tree reached its maximum size
    ///
    /// Returns `true` if a save was submitted. Nothing is submitted while a
    /// previous save still runs.
    pub fn check_tree_size(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        let size = self.tree.component_size(self.sizes.as_ref());
        if size < self.config.maximum_tree_size {
            tracing::debug!(
                "Indexing tree size {} below maximum {}",
                size,
                self.config.maximum_tree_size
            );
            return false;
        }

        let mut save_task = self.save_task.lock();
        if save_task.as_ref().map_or(false, |task| !task.is_finished()) {
            tracing::debug!("Indexing tree save still running, skipping check");
            return false;
        }

        tracing::info!(
            "Indexing tree reached {} bytes (maximum {}), saving",
            size,
            self.config.maximum_tree_size
        );
        let tree = Arc::clone(&self.tree);
        let codec = Arc::clone(&self.codec);
        let name = self.config.index_name.clone();
        *save_task = Some(self.runtime.spawn_blocking(move || {
            if let Err(e) = save_tree(&tree, codec.as_ref(), &name) {
                tracing::error!("Indexing tree saving failed: {}", e);
            }
        }));
        self.saves_submitted.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Whether a submitted save is still running
    pub fn is_saving(&self) -> bool {
        self.save_task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Number of saves submitted by the size check
    pub fn saves_submitted(&self) -> u64 {
        self.saves_submitted.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stop the size check, drain in-flight writes and save the tree
    ///
    /// Waits at most `finish_wait * finish_wait_iterations` for in-flight
    /// writes, then saves regardless. New writes are rejected from here on.
    /// Later callers wait for the first one and get the same outcome.
    pub async fn finish(&self) -> StorageResult<()> {
        self.finished.store(true, Ordering::Release);
        self.finish_outcome
            .get_or_init(|| self.run_finish())
            .await
            .clone()
            .map_err(StorageError::Persistence)
    }

    async fn run_finish(&self) -> Result<(), String> {
        if let Some(checker) = self.checker.lock().take() {
            checker.abort();
        }

        let mut iteration = 0;
        loop {
            let pending = self.write_task_in_progress_count();
            if pending == 0 {
                break;
            }
            if iteration >= self.config.finish_wait_iterations {
                tracing::warn!(
                    "Waited {:?} for write tasks, {} still in progress. Saving the indexing tree without them.",
                    self.config.finish_wait * iteration,
                    pending
                );
                break;
            }
            iteration += 1;
            tracing::info!(
                "Waiting for {} write task(s) to finish ({} of {})",
                pending,
                iteration,
                self.config.finish_wait_iterations
            );
            tokio::time::sleep(self.config.finish_wait).await;
        }

        let running = self.save_task.lock().take();
        if let Some(running) = running {
            if let Err(e) = running.await {
                tracing::warn!("Previous indexing tree save did not complete: {}", e);
            }
        }

        let tree = Arc::clone(&self.tree);
        let codec = Arc::clone(&self.codec);
        let name = self.config.index_name.clone();
        let result = self
            .runtime
            .spawn_blocking(move || save_tree(&tree, codec.as_ref(), &name))
            .await
            .map_err(|e| format!("Final save task failed: {}", e))?;

        if let Err(e) = result {
            tracing::error!("Indexing tree saving failed. Indexing tree might be lost: {}", e);
            return Err(e.to_string());
        }
        Ok(())
    }
}

fn save_tree(tree: &IndexingTree, codec: &dyn TreeCodec, name: &str) -> StorageResult<()> {
    let snapshot = tree.snapshot();
    codec.write_tree(&snapshot, name)
}
