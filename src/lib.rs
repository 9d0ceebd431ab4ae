//! # apmstore
//!
//! Persistence core of an application performance monitoring backend: stores
//! monitoring records in channel files and finds them again through an
//! in-memory indexing tree that saves itself to disk.
//!
//! ## Features
//!
//! - **Indexing tree**: Fixed-depth branch chain (platform, type, sensor,
//!   method, time bucket) ending in per-channel leaves
//! - **Write tracking**: Descriptors are completed once the bytes are on disk
//! - **Self-persistence**: The tree is saved when it grows past a size limit
//!   and on shutdown, then restored on the next open
//! - **Pooled I/O**: Bounded buffer pool, positioned channel transfers and a
//!   read-ahead descriptor stream
//!
//! ## Modules
//!
//! - [`index`]: Indexing tree, indexers, queries
//! - [`storage`]: Buffer pool, channels, tree handler, storage engine
//! - [`config`]: TOML configuration and logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apmstore::{Config, IndexQuery, MonitoringRecord, StorageConfig, StorageEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     config.logging.init()?;
//!
//!     // Open storage, restoring the indexing tree of earlier sessions
//!     let engine = StorageEngine::open(StorageConfig::from(&config)).await?;
//!
//!     // Write records
//!     engine
//!         .write(
//!             MonitoringRecord::sql(1, "SELECT * FROM orders", 4.2)
//!                 .platform(1)
//!                 .sensor_type(7),
//!         )
//!         .await?;
//!
//!     // Query SQL statements of platform 1
//!     let query = IndexQuery::new().platform(1).object_type("SqlStatement");
//!     let records = engine.query(&query).await?;
//!     println!("Found {} statements", records.len());
//!
//!     // Graceful shutdown saves the tree
//!     engine.finish().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    MonitoringRecord, RecordPayload, StorageConfig, StorageEngine, StorageError, StorageResult,
    StorageStats,
};

pub use index::{
    IndexQuery, IndexedData, IndexerSpec, IndexingRestriction, IndexingTree, RecordField,
    StorageDescriptor,
};

pub use config::{Config, ConfigError, LoggingConfig};
