//! Indexing tree persistence
//!
//! The tree is saved as a whole into `<dir>/<name>.index`, separate from the
//! channel files.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Magic "APMI" (4 bytes)                   │
//! │ Version (2 bytes, LE)                    │
//! │ Payload length (4 bytes, LE)             │
//! ├──────────────────────────────────────────┤
//! │ Payload: LZ4(bincode(TreeSnapshot))      │
//! ├──────────────────────────────────────────┤
//! │ CRC32 of everything above (4 bytes, LE)  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Files are written to a temporary name and renamed into place.

use crate::index::TreeSnapshot;
use crate::storage::error::{StorageError, StorageResult};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const INDEX_MAGIC: [u8; 4] = *b"APMI";
const INDEX_VERSION: u16 = 1;
const HEADER_SIZE: usize = 10;
const CHECKSUM_SIZE: usize = 4;

/// File extension of persisted trees
pub const INDEX_FILE_EXT: &str = "index";

/// Writes and reads whole indexing trees under a well-known name
pub trait TreeCodec: Send + Sync {
    fn write_tree(&self, snapshot: &TreeSnapshot, name: &str) -> StorageResult<()>;

    /// `Ok(None)` when nothing was saved under `name` yet
    fn read_tree(&self, name: &str) -> StorageResult<Option<TreeSnapshot>>;
}

/// [`TreeCodec`] storing trees as checksummed files in a directory
#[derive(Debug, Clone)]
pub struct FileTreeCodec {
    dir: PathBuf,
}

impl FileTreeCodec {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn index_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, INDEX_FILE_EXT))
    }

    fn encode(snapshot: &TreeSnapshot) -> StorageResult<Vec<u8>> {
        let serialized = bincode::serialize(snapshot)?;
        let payload = lz4_flex::compress_prepend_size(&serialized);
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            StorageError::Serialization(format!("Tree payload of {} bytes too large", payload.len()))
        })?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload_len.to_le_bytes());
        bytes.extend_from_slice(&payload);
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> StorageResult<TreeSnapshot> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(StorageError::Corruption(format!(
                "Index file too short: {} bytes",
                bytes.len()
            )));
        }

        let body_end = bytes.len() - CHECKSUM_SIZE;
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        let computed = crc32fast::hash(&bytes[..body_end]);
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "Index checksum mismatch: stored={}, computed={}",
                stored, computed
            )));
        }

        if bytes[0..4] != INDEX_MAGIC {
            return Err(StorageError::Corruption(format!(
                "Invalid index magic: {:?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version > INDEX_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported index version: {}",
                version
            )));
        }
        let payload_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        if HEADER_SIZE + payload_len != body_end {
            return Err(StorageError::Corruption(format!(
                "Index payload length {} does not match file size",
                payload_len
            )));
        }

        let decompressed = lz4_flex::decompress_size_prepended(&bytes[HEADER_SIZE..body_end])
            .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;
        Ok(bincode::deserialize(&decompressed)?)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let result = (|| -> StorageResult<()> {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(bytes)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl TreeCodec for FileTreeCodec {
    fn write_tree(&self, snapshot: &TreeSnapshot, name: &str) -> StorageResult<()> {
        let path = self.index_path(name);
        let bytes = Self::encode(snapshot)?;
        self.write_atomic(&path, &bytes)?;

        tracing::info!(
            "Saved indexing tree to {:?} ({} nodes, {} bytes)",
            path,
            snapshot.nodes.len(),
            bytes.len()
        );
        Ok(())
    }

    fn read_tree(&self, name: &str) -> StorageResult<Option<TreeSnapshot>> {
        let path = self.index_path(name);
        if !path.exists() {
            tracing::debug!("No persisted indexing tree at {:?}", path);
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Self::decode(&bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexingTree, PlatformIdentIndexer};
    use crate::index::record::test_support::TestRecord;
    use tempfile::tempdir;

    fn sample_snapshot() -> TreeSnapshot {
        let tree = IndexingTree::new(vec![Box::new(PlatformIdentIndexer)]);
        for id in 1..=50 {
            let slot = tree.put(&TestRecord::new(id).platform(id % 4)).unwrap();
            slot.finalize(id * 10, 10);
        }
        tree.snapshot()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let codec = FileTreeCodec::new(dir.path());
        let snapshot = sample_snapshot();

        codec.write_tree(&snapshot, "tree").unwrap();
        assert!(codec.index_path("tree").exists());

        let restored = codec.read_tree("tree").unwrap().unwrap();
        assert_eq!(restored, snapshot);

        // Only the index file remains, no temporaries
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_index() {
        let dir = tempdir().unwrap();
        let codec = FileTreeCodec::new(dir.path());
        assert!(codec.read_tree("absent").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = tempdir().unwrap();
        let codec = FileTreeCodec::new(dir.path());

        let first = sample_snapshot();
        codec.write_tree(&first, "tree").unwrap();

        let tree = IndexingTree::new(vec![Box::new(PlatformIdentIndexer)]);
        tree.put(&TestRecord::new(1)).unwrap();
        let second = tree.snapshot();
        codec.write_tree(&second, "tree").unwrap();

        assert_eq!(codec.read_tree("tree").unwrap().unwrap(), second);
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempdir().unwrap();
        let codec = FileTreeCodec::new(dir.path());
        codec.write_tree(&sample_snapshot(), "tree").unwrap();

        let path = codec.index_path("tree");
        let mut bytes = fs::read(&path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            codec.read_tree("tree"),
            Err(StorageError::Corruption(_))
        ));

        fs::write(&path, b"APMI").unwrap();
        assert!(matches!(
            codec.read_tree("tree"),
            Err(StorageError::Corruption(_))
        ));
    }
}
