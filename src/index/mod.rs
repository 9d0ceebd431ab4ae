//! Indexing tree structures
//!
//! Maps the identity of monitoring records to the physical byte ranges they
//! were written to:
//!
//! - **descriptor**: `(channel, position, size)` pointers and shared slots
//! - **indexer**: per-level key extraction strategies
//! - **leaf**: sorted id → descriptor arrays, one per channel
//! - **tree**: the fixed-depth branch/leaf composite
//! - **query**: selection criteria and restrictions
//! - **sizes**: in-memory footprint estimation
//!
//! # Architecture
//!
//! ```text
//! put(record):
//!   platform → object type → sensor type → method → time bucket → leaf
//!                                                                  ↓
//!                                               descriptor (channel, 0, 0)
//!
//! query(q):
//!   every level yields candidate keys → union of reached leaves
//!                                     → ids filtered by min/include/exclude
//! ```

pub mod descriptor;
pub mod indexer;
pub mod leaf;
pub mod query;
pub mod record;
pub mod sizes;
pub mod tree;

pub use descriptor::{DescriptorRef, StorageDescriptor};
pub use indexer::{
    BranchIndexer, ContentHashIndexer, IndexKey, IndexerSpec, MethodIdentIndexer,
    ObjectTypeIndexer, PlatformIdentIndexer, QueryKeys, SensorTypeIdentIndexer, TimestampIndexer,
};
pub use leaf::StorageLeaf;
pub use query::{IndexQuery, IndexingRestriction, RecordField, RestrictionOp};
pub use record::IndexedData;
pub use sizes::{ObjectSizes, ObjectSizes64};
pub use tree::{IndexingTree, NodeSnapshot, TreeSnapshot, TreeStats, TREE_FORMAT_VERSION};
