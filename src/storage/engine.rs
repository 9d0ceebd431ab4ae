//! apmstore Storage Engine
//!
//! The main storage engine wires the components together:
//! - Write path: MonitoringRecord → tree handler → pooled buffers → channel file
//! - Read path: IndexQuery → indexing tree → descriptor stream → decode → filter
//!
//! On open the persisted indexing tree is restored, so descriptors written in
//! earlier sessions stay queryable and new leaves continue the channel ids.

use crate::config::Config;
use crate::index::{
    BranchIndexer, IndexQuery, IndexedData, IndexerSpec, IndexingTree, ObjectSizes64,
    StorageDescriptor,
};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::channel::ChannelManager;
use crate::storage::codec::{FileTreeCodec, TreeCodec};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::stream::DescriptorInputStream;
use crate::storage::tree_handler::{IndexingTreeHandler, TreeHandlerConfig};
use crate::storage::types::MonitoringRecord;
use crate::storage::writer::StorageWriter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

const META_FORMAT_VERSION: u32 = 1;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for channel files and the index
    pub data_dir: PathBuf,
    /// Branch indexers, root first
    pub indexers: Vec<IndexerSpec>,
    /// Tree handler settings
    pub handler: TreeHandlerConfig,
    /// Number of pooled buffers (default: 64)
    pub buffer_count: usize,
    /// Size of one pooled buffer in bytes (default: 64KB)
    pub buffer_size: usize,
    /// Reads in flight per descriptor stream (default: 2)
    pub read_ahead_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("apmstore_data"),
            indexers: IndexerSpec::default_chain(),
            handler: TreeHandlerConfig::default(),
            buffer_count: 64,
            buffer_size: 64 * 1024, // 64KB
            read_ahead_depth: 2,
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn indexers(mut self, indexers: Vec<IndexerSpec>) -> Self {
        self.indexers = indexers;
        self
    }

    /// Get path to a channel file
    pub fn channel_path(&self, channel_id: u32) -> PathBuf {
        ChannelManager::new(&self.data_dir).channel_path(channel_id)
    }

    /// Get path to a persisted index
    pub fn index_path(&self, name: &str) -> PathBuf {
        FileTreeCodec::new(&self.data_dir).index_path(name)
    }

    /// Get path to the storage metadata file
    pub fn meta_path(&self) -> PathBuf {
        self.data_dir.join("storage.json")
    }
}

impl From<&Config> for StorageConfig {
    fn from(config: &Config) -> Self {
        Self {
            data_dir: PathBuf::from(&config.storage.data_dir),
            indexers: config.indexing.indexers.clone(),
            handler: TreeHandlerConfig {
                maximum_tree_size: config.indexing.maximum_indexing_tree_size,
                check_interval: Duration::from_secs(config.indexing.tree_check_interval_secs),
                index_name: config.indexing.index_file_name.clone(),
                finish_wait: Duration::from_millis(config.indexing.finish_wait_ms),
                finish_wait_iterations: config.indexing.finish_wait_iterations,
            },
            buffer_count: config.io.buffer_count,
            buffer_size: config.io.buffer_size,
            read_ahead_depth: config.io.read_ahead_depth,
        }
    }
}

/// Metadata stored next to the data, describing how it is indexed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMeta {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub indexers: Vec<IndexerSpec>,
}

impl StorageMeta {
    /// Load from JSON file
    pub fn load(path: &Path) -> StorageResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Save to JSON file
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// The main apmstore storage engine
pub struct StorageEngine {
    /// Configuration
    config: StorageConfig,
    /// Write tracking and tree persistence
    handler: Arc<IndexingTreeHandler>,
    /// Producer side of the write path
    writer: StorageWriter,
    /// Open channel files
    channels: ChannelManager,
    /// Buffers shared by writes and reads
    pool: BufferPool,
}

impl StorageEngine {
    /// Open or create a storage directory
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(config: StorageConfig) -> StorageResult<Self> {
        if config.buffer_count == 0 || config.buffer_size == 0 {
            return Err(StorageError::Config(
                "buffer count and buffer size must be > 0".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.data_dir)?;

        // Check the indexer chain the data was written with
        let meta_path = config.meta_path();
        match StorageMeta::load(&meta_path)? {
            Some(meta) if meta.indexers != config.indexers => {
                return Err(StorageError::IndexerChainMismatch {
                    persisted: describe_chain(&meta.indexers),
                    configured: describe_chain(&config.indexers),
                });
            }
            Some(_) => {}
            None => StorageMeta {
                format_version: META_FORMAT_VERSION,
                created_at: Utc::now(),
                indexers: config.indexers.clone(),
            }
            .save(&meta_path)?,
        }

        // Restore the indexing tree
        let codec = FileTreeCodec::new(&config.data_dir);
        let index_name = &config.handler.index_name;
        let tree = match codec.read_tree(index_name)? {
            Some(snapshot) => {
                let tree =
                    IndexingTree::restore(snapshot, IndexerSpec::build_chain(&config.indexers))?;
                let stats = tree.stats();
                tracing::info!(
                    "Restored indexing tree {:?}: {} leaves, {} descriptors",
                    codec.index_path(index_name),
                    stats.leaf_count,
                    stats.descriptor_count
                );
                tree
            }
            None => IndexingTree::from_specs(&config.indexers),
        };

        let handler = Arc::new(IndexingTreeHandler::new(
            Arc::new(tree),
            Arc::new(codec),
            Arc::new(ObjectSizes64),
            config.handler.clone(),
            Handle::current(),
        ));
        handler.start();

        let pool = BufferPool::new(config.buffer_count, config.buffer_size);
        let channels = ChannelManager::new(&config.data_dir);
        let writer = StorageWriter::new(Arc::clone(&handler), channels.clone(), pool.clone());

        tracing::info!("Opened storage at {:?}", config.data_dir);
        Ok(Self {
            config,
            handler,
            writer,
            channels,
            pool,
        })
    }

    /// Write a single record
    pub async fn write(&self, record: MonitoringRecord) -> StorageResult<StorageDescriptor> {
        self.writer.write(Arc::new(record)).await
    }

    /// Write multiple records concurrently, one result per record
    pub async fn write_batch(
        &self,
        records: Vec<MonitoringRecord>,
    ) -> Vec<StorageResult<StorageDescriptor>> {
        self.writer
            .write_batch(records.into_iter().map(Arc::new).collect())
            .await
    }

    /// Descriptors of written records the tree selects for `query`
    ///
    /// Records still being written are left out.
    pub fn descriptors(&self, query: &IndexQuery) -> Vec<StorageDescriptor> {
        self.handler
            .tree()
            .query(query)
            .into_iter()
            .map(|slot| slot.snapshot())
            .filter(|descriptor| descriptor.is_set())
            .collect()
    }

    /// Stream over the bytes of `descriptors`
    pub fn open_stream(&self, descriptors: &[StorageDescriptor]) -> DescriptorInputStream {
        DescriptorInputStream::new(
            self.channels.clone(),
            self.pool.clone(),
            descriptors,
            self.config.read_ahead_depth,
        )
    }

    /// Read and decode the records behind `descriptors`, in the given order
    pub async fn read(
        &self,
        descriptors: &[StorageDescriptor],
    ) -> StorageResult<Vec<MonitoringRecord>> {
        let mut stream = self.open_stream(descriptors);
        let result = decode_all(&mut stream, descriptors).await;
        stream.close().await;
        result
    }

    /// Query records
    ///
    /// The tree narrows the candidates; the interval, object type and
    /// restrictions are then checked on every decoded record. Results are
    /// sorted by id.
    pub async fn query(&self, query: &IndexQuery) -> StorageResult<Vec<MonitoringRecord>> {
        let descriptors = self.descriptors(query);
        tracing::debug!("Query selected {} descriptors", descriptors.len());

        let mut records: Vec<MonitoringRecord> = self
            .read(&descriptors)
            .await?
            .into_iter()
            .filter(|record| query.matches_record(record))
            .collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    /// Look up a stored record by the identity of `element`
    pub async fn get(&self, element: &dyn IndexedData) -> StorageResult<Option<MonitoringRecord>> {
        let Some(slot) = self.handler.tree().get(element) else {
            return Ok(None);
        };
        let descriptor = slot.snapshot();
        if !descriptor.is_set() {
            return Ok(None);
        }
        Ok(self.read(&[descriptor]).await?.into_iter().next())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        let tree = self.handler.tree();
        let tree_stats = tree.stats();

        StorageStats {
            leaf_count: tree_stats.leaf_count,
            branch_count: tree_stats.branch_count,
            channel_count: tree.channel_ids().len(),
            descriptor_count: tree_stats.descriptor_count,
            in_flight: self.handler.write_task_in_progress_count(),
            tree_size_estimate: tree.component_size(&ObjectSizes64),
            pool_available: self.pool.available(),
            pool_capacity: self.pool.capacity(),
            saves_submitted: self.handler.saves_submitted(),
        }
    }

    /// Save the indexing tree now if it reached its maximum size
    pub fn check_tree_size(&self) -> bool {
        self.handler.check_tree_size()
    }

    /// Shutdown the engine gracefully
    ///
    /// Waits for running writes, saves the indexing tree and closes every
    /// channel. Reads keep working afterwards; writes fail with
    /// [`StorageError::Closed`].
    pub async fn finish(&self) -> StorageResult<()> {
        self.writer.close().await;
        let saved = self.handler.finish().await;

        if let Err(e) = self.channels.close_all().await {
            tracing::error!("Failed to close channels: {}", e);
            saved?;
            return Err(e.into());
        }
        saved?;

        tracing::info!("Storage at {:?} finished", self.config.data_dir);
        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<IndexingTree> {
        self.handler.tree()
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.config.data_dir)
            .field("handler", &self.handler)
            .field("pool_available", &self.pool.available())
            .finish()
    }
}

async fn decode_all(
    stream: &mut DescriptorInputStream,
    descriptors: &[StorageDescriptor],
) -> StorageResult<Vec<MonitoringRecord>> {
    let mut records = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors.iter().filter(|d| d.size > 0) {
        let mut bytes = vec![0u8; descriptor.size as usize];
        stream.read_exact(&mut bytes).await?;
        let record: MonitoringRecord = bincode::deserialize(&bytes).map_err(|e| {
            StorageError::Corruption(format!("Undecodable record at {}: {}", descriptor, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

fn describe_chain(specs: &[IndexerSpec]) -> Vec<String> {
    IndexerSpec::build_chain(specs)
        .iter()
        .map(|indexer| indexer.describe())
        .collect()
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub leaf_count: usize,
    pub branch_count: usize,
    pub channel_count: usize,
    pub descriptor_count: usize,
    pub in_flight: usize,
    pub tree_size_estimate: u64,
    pub pool_available: usize,
    pub pool_capacity: usize,
    pub saves_submitted: u64,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Leaves: {}, Descriptors: {}, In flight: {}, Tree: {:.2} MB, Buffers: {}/{}",
            self.leaf_count,
            self.descriptor_count,
            self.in_flight,
            self.tree_size_estimate as f64 / (1024.0 * 1024.0),
            self.pool_available,
            self.pool_capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexingRestriction, RecordField};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn small_config(dir: &Path) -> StorageConfig {
        StorageConfig {
            buffer_count: 8,
            buffer_size: 256,
            ..StorageConfig::new(dir)
        }
    }

    async fn create_test_engine() -> (StorageEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(small_config(dir.path())).await.unwrap();
        (engine, dir)
    }

    fn sample_records() -> Vec<MonitoringRecord> {
        (1..=30)
            .map(|id| {
                let base = if id % 3 == 0 {
                    MonitoringRecord::sql(id, format!("SELECT {} FROM dual", id), id as f64)
                } else {
                    MonitoringRecord::timer(id, id as f64)
                };
                base.platform(id % 2 + 1)
                    .sensor_type(10)
                    .timestamp(1_700_000_000_000 + id as i64 * 60_000)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let (engine, dir) = create_test_engine().await;
        let stats = engine.stats();
        assert_eq!(stats.descriptor_count, 0);
        assert_eq!(stats.pool_available, 8);
        assert!(dir.path().join("storage.json").exists());
    }

    #[tokio::test]
    async fn test_write_and_get() {
        let (engine, _dir) = create_test_engine().await;

        let record = MonitoringRecord::exception(5, "java.lang.IllegalStateException", "boom")
            .platform(1)
            .sensor_type(3)
            .timestamp(1_700_000_000_000);
        let descriptor = engine.write(record.clone()).await.unwrap();
        assert!(descriptor.is_set());

        let fetched = engine.get(&record).await.unwrap().unwrap();
        assert_eq!(fetched, record);

        let absent = MonitoringRecord::timer(99, 1.0).platform(1);
        assert!(engine.get(&absent).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_batch_and_query() {
        let (engine, _dir) = create_test_engine().await;
        let results = engine.write_batch(sample_records()).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let all = engine.query(&IndexQuery::new()).await.unwrap();
        assert_eq!(all.len(), 30);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let platform_two = engine.query(&IndexQuery::new().platform(2)).await.unwrap();
        assert_eq!(platform_two.len(), 15);
        assert!(platform_two.iter().all(|r| r.platform_ident == 2));

        let statements = engine
            .query(&IndexQuery::new().object_type("SqlStatement"))
            .await
            .unwrap();
        assert_eq!(statements.len(), 10);

        let newer = engine.query(&IndexQuery::new().min_id(21)).await.unwrap();
        assert_eq!(newer.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_query_interval_and_restrictions() {
        let (engine, _dir) = create_test_engine().await;
        engine.write_batch(sample_records()).await;

        let from = Utc.timestamp_millis_opt(1_700_000_000_000 + 10 * 60_000).unwrap();
        let to = Utc.timestamp_millis_opt(1_700_000_000_000 + 19 * 60_000).unwrap();
        let window = engine
            .query(&IndexQuery::new().interval(from, to))
            .await
            .unwrap();
        let ids: Vec<u64> = window.iter().map(|r| r.id).collect();
        assert_eq!(ids, (10..=19).collect::<Vec<_>>());

        let restricted = engine
            .query(
                &IndexQuery::new()
                    .restriction(IndexingRestriction::greater_or_equal(RecordField::Id, 25))
                    .exclude_ids([30]),
            )
            .await
            .unwrap();
        let ids: Vec<u64> = restricted.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![25, 26, 27, 28, 29]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reopen_restores_tree() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());

        // First session: write and finish
        {
            let engine = StorageEngine::open(config.clone()).await.unwrap();
            engine.write_batch(sample_records()).await;
            engine.finish().await.unwrap();
            assert!(config.index_path("indexing_tree").exists());
        }

        // Second session: data is queryable and new leaves get fresh channels
        {
            let engine = StorageEngine::open(config).await.unwrap();
            let before = engine.tree().channel_ids();
            assert_eq!(engine.query(&IndexQuery::new()).await.unwrap().len(), 30);

            let fresh = MonitoringRecord::timer(100, 1.0).platform(42);
            let descriptor = engine.write(fresh).await.unwrap();
            assert!(!before.contains(&descriptor.channel_id));
            assert!(descriptor.channel_id > *before.iter().max().unwrap());
        }
    }

    #[tokio::test]
    async fn test_reopen_with_other_chain_fails() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        StorageEngine::open(config.clone()).await.unwrap();

        let other = config.indexers(vec![IndexerSpec::PlatformIdent]);
        let err = StorageEngine::open(other).await.unwrap_err();
        assert!(matches!(err, StorageError::IndexerChainMismatch { .. }));
    }

    #[tokio::test]
    async fn test_finish_rejects_writes_keeps_reads() {
        let (engine, _dir) = create_test_engine().await;
        let record = MonitoringRecord::timer(1, 2.0).platform(1);
        engine.write(record.clone()).await.unwrap();

        engine.finish().await.unwrap();
        // Idempotent
        engine.finish().await.unwrap();

        let err = engine.write(MonitoringRecord::timer(2, 1.0)).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
        assert_eq!(engine.get(&record).await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_sql_query_filters_shared_hash_bucket() {
        let dir = tempdir().unwrap();
        let config =
            small_config(dir.path()).indexers(vec![IndexerSpec::ContentHash { max_keys: 1 }]);
        let engine = StorageEngine::open(config).await.unwrap();

        engine
            .write(MonitoringRecord::sql(1, "SELECT a FROM t", 1.0))
            .await
            .unwrap();
        engine
            .write(MonitoringRecord::sql(2, "DELETE FROM t", 1.0))
            .await
            .unwrap();
        engine.write(MonitoringRecord::timer(3, 1.0)).await.unwrap();

        // All three share the single hash bucket
        let candidates = engine.descriptors(&IndexQuery::new().sql("SELECT a FROM t"));
        assert_eq!(candidates.len(), 3);

        let records = engine
            .query(&IndexQuery::new().sql("SELECT a FROM t"))
            .await
            .unwrap();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (engine, _dir) = create_test_engine().await;
        let record = MonitoringRecord::timer(7, 1.0).platform(1);
        engine.write(record.clone()).await.unwrap();

        let err = engine.write(record).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateId { id: 7, .. }));
        assert_eq!(engine.stats().descriptor_count, 1);
    }

    #[test]
    fn test_config_from_file_config() {
        let mut file_config = Config::default();
        file_config.storage.data_dir = "/data/apm".to_string();
        file_config.indexing.tree_check_interval_secs = 5;
        file_config.io.buffer_count = 16;

        let config = StorageConfig::from(&file_config);
        assert_eq!(config.data_dir, PathBuf::from("/data/apm"));
        assert_eq!(config.handler.check_interval, Duration::from_secs(5));
        assert_eq!(config.buffer_count, 16);
        assert_eq!(
            config.channel_path(3),
            PathBuf::from("/data/apm/3.itdata")
        );
        assert_eq!(
            config.index_path("indexing_tree"),
            PathBuf::from("/data/apm/indexing_tree.index")
        );
    }
}
