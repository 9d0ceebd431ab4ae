//! apmstore Storage Engine
//!
//! This module provides the persistence side of the store:
//!
//! - **types**: The record model (MonitoringRecord, RecordPayload)
//! - **buffer_pool**: Fixed set of reusable I/O buffers
//! - **channel**: Positioned reads and appends against channel files
//! - **stream**: Read-ahead input stream over storage descriptors
//! - **codec**: Indexing tree file format
//! - **tree_handler**: Write tracking and periodic tree persistence
//! - **writer**: Serializes records and drives the write path
//! - **engine**: Main storage engine orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   MonitoringRecord → tree.put (slot) → bincode → Buffers → Channel file
//!                                     ← write_successful(position, size)
//!
//! Read Path:
//!   IndexQuery → Tree → Descriptors → Stream (read ahead) → Decode → Filter
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use apmstore::storage::{MonitoringRecord, StorageConfig, StorageEngine};
//! use apmstore::index::IndexQuery;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open engine
//!     let engine = StorageEngine::open(StorageConfig::new("./data")).await?;
//!
//!     // Write a record
//!     engine.write(MonitoringRecord::timer(1, 12.5).platform(1)).await?;
//!
//!     // Query records of one platform
//!     let records = engine.query(&IndexQuery::new().platform(1)).await?;
//!     println!("Found {} records", records.len());
//!
//!     engine.finish().await?;
//!     Ok(())
//! }
//! ```

pub mod buffer_pool;
pub mod channel;
pub mod codec;
pub mod engine;
pub mod error;
pub mod stream;
pub mod tree_handler;
pub mod types;
pub mod writer;

// Re-export commonly used types
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use channel::{ChannelManager, TransferCompletion, TransferHandle, TransferOutcome};
pub use codec::{FileTreeCodec, TreeCodec};
pub use engine::{StorageConfig, StorageEngine, StorageMeta, StorageStats};
pub use error::{StorageError, StorageResult};
pub use stream::DescriptorInputStream;
pub use tree_handler::{IndexingTreeHandler, TreeHandlerConfig};
pub use types::{MonitoringRecord, RecordPayload};
pub use writer::{RecordWriteTask, StorageWriter, WriteTask};
