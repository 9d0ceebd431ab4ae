//! Indexing leaf
//!
//! A leaf is bound to exactly one channel and keeps two parallel arrays: the
//! record ids in ascending order and the descriptor slots for those ids.
//! Lookups are binary searches; queries start at the first id `>= min_id`
//! and scan linearly from there.

use crate::index::descriptor::{DescriptorRef, StorageDescriptor};
use crate::index::query::IndexQuery;
use crate::index::record::IndexedData;
use crate::index::sizes::ObjectSizes;
use crate::storage::{StorageError, StorageResult};

/// Terminal tree node holding the descriptors of one channel
#[derive(Debug)]
pub struct StorageLeaf {
    channel_id: u32,
    ids: Vec<u64>,
    descriptors: Vec<DescriptorRef>,
}

impl StorageLeaf {
    pub fn new(channel_id: u32) -> Self {
        Self {
            channel_id,
            ids: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Allocate an unset descriptor for a new element
    pub fn put(&mut self, element: &dyn IndexedData) -> StorageResult<DescriptorRef> {
        let slot = DescriptorRef::unset(self.channel_id);
        self.insert(element.id(), slot.clone())?;
        Ok(slot)
    }

    /// Index an element with an already known descriptor
    pub fn put_with(
        &mut self,
        element: &dyn IndexedData,
        descriptor: StorageDescriptor,
    ) -> StorageResult<DescriptorRef> {
        if descriptor.channel_id != self.channel_id {
            return Err(StorageError::Indexing(format!(
                "Descriptor for channel {} can not be put into leaf of channel {}",
                descriptor.channel_id, self.channel_id
            )));
        }
        let slot = DescriptorRef::restored(descriptor);
        self.insert(element.id(), slot.clone())?;
        Ok(slot)
    }

    fn insert(&mut self, id: u64, slot: DescriptorRef) -> StorageResult<()> {
        if id == 0 {
            return Err(StorageError::Indexing(
                "Element to index can not have an id equal to zero".to_string(),
            ));
        }
        match self.ids.binary_search(&id) {
            Ok(_) => Err(StorageError::DuplicateId {
                id,
                channel_id: self.channel_id,
            }),
            Err(index) => {
                self.ids.insert(index, id);
                self.descriptors.insert(index, slot);
                Ok(())
            }
        }
    }

    pub fn get(&self, element: &dyn IndexedData) -> Option<DescriptorRef> {
        self.get_by_id(element.id())
    }

    pub fn get_by_id(&self, id: u64) -> Option<DescriptorRef> {
        self.ids
            .binary_search(&id)
            .ok()
            .map(|index| self.descriptors[index].clone())
    }

    /// Look up and unlink an element
    pub fn get_and_remove(&mut self, element: &dyn IndexedData) -> Option<DescriptorRef> {
        let index = self.ids.binary_search(&element.id()).ok()?;
        self.ids.remove(index);
        Some(self.descriptors.remove(index))
    }

    /// Descriptors whose ids pass the query's id bounds and sets
    pub fn query(&self, query: &IndexQuery) -> Vec<DescriptorRef> {
        let start = self.ids.partition_point(|id| *id < query.min_id);
        self.ids[start..]
            .iter()
            .zip(&self.descriptors[start..])
            .filter(|(id, _)| query.accepts_id(**id))
            .map(|(_, slot)| slot.clone())
            .collect()
    }

    /// `(id, descriptor)` pairs in id order
    pub fn entries(&self) -> impl Iterator<Item = (u64, StorageDescriptor)> + '_ {
        self.ids
            .iter()
            .zip(&self.descriptors)
            .map(|(id, slot)| (*id, slot.snapshot()))
    }

    /// Rebuild a leaf from persisted entries
    pub fn from_entries(
        channel_id: u32,
        entries: impl IntoIterator<Item = (u64, StorageDescriptor)>,
    ) -> StorageResult<Self> {
        let mut leaf = Self::new(channel_id);
        for (id, descriptor) in entries {
            if descriptor.channel_id != channel_id {
                return Err(StorageError::Corruption(format!(
                    "Descriptor of channel {} stored in leaf {}",
                    descriptor.channel_id, channel_id
                )));
            }
            leaf.insert(id, DescriptorRef::restored(descriptor))?;
        }
        Ok(leaf)
    }

    /// Approximate memory held by this leaf
    pub fn component_size(&self, sizes: &dyn ObjectSizes) -> u64 {
        let len = self.ids.len() as u64;
        let mut size = sizes.object_header_size();
        size += sizes.primitive_types_size(2, 0, 4, 0, 0, 0);
        size += sizes.array_size(self.ids.capacity() as u64);
        size += len * sizes.primitive_types_size(0, 0, 0, 0, 1, 0);
        size += sizes.array_size(self.descriptors.capacity() as u64);
        size += len
            * sizes.align_to_8(sizes.object_header_size() + sizes.primitive_types_size(0, 0, 1, 0, 2, 0));
        sizes.align_to_8(size)
    }
}
