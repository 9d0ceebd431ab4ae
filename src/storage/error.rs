//! Storage error types
//!
//! Defines all errors that can occur in the indexing and storage layers.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// An element with the same id is already indexed in the leaf
    #[error("Element with id {id} already indexed in channel {channel_id}")]
    DuplicateId { id: u64, channel_id: u32 },

    /// Indexing failed (missing data, unusable element, misconfigured tree)
    #[error("Indexing error: {0}")]
    Indexing(String),

    /// A persisted tree was built with a different indexer chain
    #[error("Indexer chain mismatch: persisted {persisted:?}, configured {configured:?}")]
    IndexerChainMismatch {
        persisted: Vec<String>,
        configured: Vec<String>,
    },

    /// Encoded record does not fit into the buffer pool
    #[error("Record of {size} bytes exceeds the pooled buffer limit of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    /// More buffers were requested at once than the pool owns
    #[error("Requested {requested} buffers from a pool of {capacity}")]
    BufferRequest { requested: usize, capacity: usize },

    /// The buffer pool was closed
    #[error("Buffer pool is closed")]
    PoolClosed,

    /// A channel transfer failed
    #[error("Transfer on channel {channel_id} failed: {message}")]
    Transfer { channel_id: u32, message: String },

    /// Storage was already finished
    #[error("Storage is closed")]
    Closed,

    /// Saving the indexing tree failed
    #[error("Indexing tree persistence failed: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::DuplicateId {
            id: 7,
            channel_id: 3,
        };
        assert_eq!(err.to_string(), "Element with id 7 already indexed in channel 3");

        let err = StorageError::Closed;
        assert_eq!(err.to_string(), "Storage is closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
