//! In-memory size estimation
//!
//! The periodic tree size check only needs an approximation of how much memory
//! the indexing tree holds. The estimator is injected so tests can substitute
//! a fixed value.

pub const BOOLEAN_SIZE: u64 = 1;
pub const INT_SIZE: u64 = 4;
pub const FLOAT_SIZE: u64 = 4;
pub const LONG_SIZE: u64 = 8;
pub const DOUBLE_SIZE: u64 = 8;

const MAP_INITIAL_CAPACITY: u64 = 16;

/// Approximates the footprint of objects held by the index
pub trait ObjectSizes: Send + Sync {
    /// Size of one reference (pointer)
    fn reference_size(&self) -> u64;

    /// Size of an object header
    fn object_header_size(&self) -> u64;

    /// Round up to the next multiple of 8
    fn align_to_8(&self, size: u64) -> u64 {
        (size + 7) & !7
    }

    /// Combined size of the given number of fields per kind
    fn primitive_types_size(
        &self,
        references: u64,
        booleans: u64,
        ints: u64,
        floats: u64,
        longs: u64,
        doubles: u64,
    ) -> u64 {
        references * self.reference_size()
            + booleans * BOOLEAN_SIZE
            + ints * INT_SIZE
            + floats * FLOAT_SIZE
            + longs * LONG_SIZE
            + doubles * DOUBLE_SIZE
    }

    /// Size of an array of `len` references
    fn array_size(&self, len: u64) -> u64 {
        self.align_to_8(self.object_header_size() + self.primitive_types_size(len, 0, 1, 0, 0, 0))
    }

    /// Size of a hash map with `len` entries, excluding keys and values
    fn hash_map_size(&self, len: u64) -> u64 {
        let mut size = self.object_header_size() + self.primitive_types_size(4, 0, 4, 1, 0, 0);
        if len > 0 {
            let mut capacity = MAP_INITIAL_CAPACITY;
            while capacity * 3 / 4 < len {
                capacity *= 2;
            }
            size += self.array_size(capacity);
        }
        let entry = self.align_to_8(self.object_header_size() + self.primitive_types_size(3, 0, 1, 0, 0, 0));
        size += len * entry;
        self.align_to_8(size)
    }
}

/// Estimator for a 64-bit process
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectSizes64;

impl ObjectSizes for ObjectSizes64 {
    fn reference_size(&self) -> u64 {
        8
    }

    fn object_header_size(&self) -> u64 {
        16
    }
}
