//! Storage descriptors
//!
//! A [`StorageDescriptor`] is a byte-exact pointer `(channel, position, size)`
//! into a channel file. Leaves own the canonical descriptor slots; callers and
//! the write tracker hold a [`DescriptorRef`] to the same slot and finalize it
//! in place once the physical write completes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Physical location of one stored record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageDescriptor {
    /// Channel (file) the record lives in
    pub channel_id: u32,
    /// Byte offset within the channel file
    pub position: u64,
    /// Number of bytes
    pub size: u64,
}

impl StorageDescriptor {
    /// Descriptor bound to a channel with position and size still unset
    pub fn unset(channel_id: u32) -> Self {
        Self {
            channel_id,
            position: 0,
            size: 0,
        }
    }

    pub fn new(channel_id: u32, position: u64, size: u64) -> Self {
        Self {
            channel_id,
            position,
            size,
        }
    }

    /// True once the physical write reported position and size
    pub fn is_set(&self) -> bool {
        self.position != 0 || self.size != 0
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.position + self.size
    }
}

impl fmt::Display for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel {} [{}..{})",
            self.channel_id,
            self.position,
            self.end()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    position: u64,
    size: u64,
}

/// Shared handle to a descriptor slot owned by a leaf
///
/// The slot is written at most once. Every clone observes the same value.
#[derive(Debug, Clone)]
pub struct DescriptorRef {
    channel_id: u32,
    extent: Arc<OnceLock<Extent>>,
}

impl DescriptorRef {
    pub(crate) fn unset(channel_id: u32) -> Self {
        Self {
            channel_id,
            extent: Arc::new(OnceLock::new()),
        }
    }

    /// Rebuild a slot from a persisted descriptor
    pub(crate) fn restored(descriptor: StorageDescriptor) -> Self {
        let slot = Self::unset(descriptor.channel_id);
        if descriptor.is_set() {
            let _ = slot.extent.set(Extent {
                position: descriptor.position,
                size: descriptor.size,
            });
        }
        slot
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Set the final position and size.
    ///
    /// Returns `false` if the slot was already finalized; the first value wins.
    pub fn finalize(&self, position: u64, size: u64) -> bool {
        self.extent.set(Extent { position, size }).is_ok()
    }

    pub fn is_finalized(&self) -> bool {
        self.extent.get().is_some()
    }

    /// Current value of the slot
    pub fn snapshot(&self) -> StorageDescriptor {
        match self.extent.get() {
            Some(extent) => StorageDescriptor::new(self.channel_id, extent.position, extent.size),
            None => StorageDescriptor::unset(self.channel_id),
        }
    }

    /// Whether both handles point at the same slot
    pub fn same_slot(&self, other: &DescriptorRef) -> bool {
        Arc::ptr_eq(&self.extent, &other.extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_descriptor() {
        let slot = DescriptorRef::unset(4);
        let descriptor = slot.snapshot();

        assert_eq!(descriptor.channel_id, 4);
        assert_eq!(descriptor.position, 0);
        assert_eq!(descriptor.size, 0);
        assert!(!descriptor.is_set());
    }

    #[test]
    fn test_finalize_once() {
        let slot = DescriptorRef::unset(1);
        let caller_copy = slot.clone();

        assert!(slot.finalize(128, 64));
        assert!(!caller_copy.finalize(0, 1));

        assert_eq!(caller_copy.snapshot(), StorageDescriptor::new(1, 128, 64));
        assert!(slot.same_slot(&caller_copy));
    }

    #[test]
    fn test_restored_unset_stays_open() {
        let slot = DescriptorRef::restored(StorageDescriptor::unset(9));
        assert!(!slot.is_finalized());
        assert!(slot.finalize(10, 20));
        assert_eq!(slot.snapshot().end(), 30);
    }
}
