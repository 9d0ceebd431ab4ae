//! Indexing tree
//!
//! A fixed-depth tree whose levels are bound to the configured indexer chain.
//! Nodes live in an arena (`Vec<Node>`); node `0` is the root. Every
//! operation walks the levels iteratively: compute the key with the indexer
//! of the current depth, resolve the child, continue. The final level holds
//! [`StorageLeaf`]s, each bound to its own channel.
//!
//! ```text
//! root (platform) ─┬─ 1 ─ (object type) ─┬─ Timer ──────── leaf #1
//!                  │                      └─ SqlStatement ─ leaf #2
//!                  └─ 2 ─ (object type) ─── Timer ──────── leaf #3
//! ```
//!
//! Mutations take a single tree-wide write lock; lookups and queries share
//! the read lock.

use crate::index::descriptor::{DescriptorRef, StorageDescriptor};
use crate::index::indexer::{BranchIndexer, IndexKey, IndexerSpec, QueryKeys};
use crate::index::leaf::StorageLeaf;
use crate::index::query::IndexQuery;
use crate::index::record::IndexedData;
use crate::index::sizes::ObjectSizes;
use crate::storage::{StorageError, StorageResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the [`TreeSnapshot`] layout
pub const TREE_FORMAT_VERSION: u16 = 1;

type NodeId = usize;

#[derive(Debug, Default)]
struct Branch {
    /// Every known key, shared keys alias the same child
    children: BTreeMap<IndexKey, NodeId>,
}

#[derive(Debug)]
enum Node {
    Branch(Branch),
    Leaf(StorageLeaf),
}

#[derive(Debug)]
struct TreeState {
    nodes: Vec<Node>,
    next_channel_id: u32,
}

/// Statistics about the tree shape
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: usize,
    pub branch_count: usize,
    pub leaf_count: usize,
    pub descriptor_count: usize,
}

/// Multi-level index from record attributes to storage descriptors
#[derive(Debug)]
pub struct IndexingTree {
    indexers: Vec<Box<dyn BranchIndexer>>,
    state: RwLock<TreeState>,
}

impl IndexingTree {
    /// Create an empty tree. An empty chain makes the root a single leaf.
    pub fn new(indexers: Vec<Box<dyn BranchIndexer>>) -> Self {
        let mut state = TreeState {
            nodes: Vec::new(),
            next_channel_id: 1,
        };
        let root = if indexers.is_empty() {
            state.next_channel_id = 2;
            Node::Leaf(StorageLeaf::new(1))
        } else {
            Node::Branch(Branch::default())
        };
        state.nodes.push(root);

        Self {
            indexers,
            state: RwLock::new(state),
        }
    }

    pub fn from_specs(specs: &[IndexerSpec]) -> Self {
        Self::new(IndexerSpec::build_chain(specs))
    }

    /// Identity of the indexer chain, one entry per level
    pub fn indexer_chain(&self) -> Vec<String> {
        self.indexers.iter().map(|i| i.describe()).collect()
    }

    pub fn depth(&self) -> usize {
        self.indexers.len()
    }

    /// Channel id the next new leaf will be bound to
    pub fn next_channel_id(&self) -> u32 {
        self.state.read().next_channel_id
    }

    // ==================== Write Path ====================

    /// Index a new element and return its (unset) descriptor slot
    pub fn put(&self, element: &dyn IndexedData) -> StorageResult<DescriptorRef> {
        let mut state = self.state.write();
        let leaf = self.leaf_for_insert(&mut state, element)?;
        match &mut state.nodes[leaf] {
            Node::Leaf(leaf) => leaf.put(element),
            Node::Branch(_) => Err(StorageError::Indexing(
                "Indexing path ended in a branch".to_string(),
            )),
        }
    }

    /// Index an element with a known descriptor
    ///
    /// The descriptor must belong to the channel of the leaf the element
    /// routes to.
    pub fn put_with(
        &self,
        element: &dyn IndexedData,
        descriptor: StorageDescriptor,
    ) -> StorageResult<DescriptorRef> {
        let mut state = self.state.write();
        let leaf = self.leaf_for_insert(&mut state, element)?;
        match &mut state.nodes[leaf] {
            Node::Leaf(leaf) => leaf.put_with(element, descriptor),
            Node::Branch(_) => Err(StorageError::Indexing(
                "Indexing path ended in a branch".to_string(),
            )),
        }
    }

    /// Look up and unlink an element
    pub fn get_and_remove(&self, element: &dyn IndexedData) -> Option<DescriptorRef> {
        let mut state = self.state.write();
        let leaf = self.find_leaf(&state, element)?;
        match &mut state.nodes[leaf] {
            Node::Leaf(leaf) => leaf.get_and_remove(element),
            Node::Branch(_) => None,
        }
    }

    fn leaf_for_insert(
        &self,
        state: &mut TreeState,
        element: &dyn IndexedData,
    ) -> StorageResult<NodeId> {
        let mut node = 0;
        for (depth, indexer) in self.indexers.iter().enumerate() {
            let key = indexer.key(element);
            node = self.child_or_insert(state, node, depth, key)?;
        }
        Ok(node)
    }

    fn child_or_insert(
        &self,
        state: &mut TreeState,
        node: NodeId,
        depth: usize,
        key: IndexKey,
    ) -> StorageResult<NodeId> {
        let indexer = &self.indexers[depth];
        let bucket = if indexer.shared_instance() {
            indexer.shared_bucket(&key)
        } else {
            key.clone()
        };

        let existing = match &state.nodes[node] {
            Node::Branch(branch) => (
                branch.children.get(&key).copied(),
                branch.children.get(&bucket).copied(),
            ),
            Node::Leaf(_) => {
                return Err(StorageError::Indexing(format!(
                    "Expected branch at depth {}",
                    depth
                )))
            }
        };

        let child = match existing {
            (Some(child), _) => return Ok(child),
            (None, Some(shared)) => shared,
            (None, None) => {
                let child = if depth + 1 == self.indexers.len() {
                    let channel_id = state.next_channel_id;
                    state.next_channel_id = channel_id.checked_add(1).ok_or_else(|| {
                        StorageError::Indexing("Channel ids exhausted".to_string())
                    })?;
                    tracing::debug!("Created indexing leaf for channel {}", channel_id);
                    Node::Leaf(StorageLeaf::new(channel_id))
                } else {
                    Node::Branch(Branch::default())
                };
                state.nodes.push(child);
                state.nodes.len() - 1
            }
        };

        if let Node::Branch(branch) = &mut state.nodes[node] {
            branch.children.insert(key, child);
            branch.children.entry(bucket).or_insert(child);
        }
        Ok(child)
    }

    // ==================== Lookup Methods ====================

    pub fn get(&self, element: &dyn IndexedData) -> Option<DescriptorRef> {
        let state = self.state.read();
        let leaf = self.find_leaf(&state, element)?;
        match &state.nodes[leaf] {
            Node::Leaf(leaf) => leaf.get(element),
            Node::Branch(_) => None,
        }
    }

    fn find_leaf(&self, state: &TreeState, element: &dyn IndexedData) -> Option<NodeId> {
        let mut node = 0;
        for indexer in &self.indexers {
            let key = indexer.key(element);
            node = self.lookup_child(state, node, indexer.as_ref(), &key)?;
        }
        Some(node)
    }

    fn lookup_child(
        &self,
        state: &TreeState,
        node: NodeId,
        indexer: &dyn BranchIndexer,
        key: &IndexKey,
    ) -> Option<NodeId> {
        let Node::Branch(branch) = &state.nodes[node] else {
            return None;
        };
        if let Some(child) = branch.children.get(key) {
            return Some(*child);
        }
        if indexer.shared_instance() {
            return branch.children.get(&indexer.shared_bucket(key)).copied();
        }
        None
    }

    /// Descriptors of every leaf the query reaches, unioned
    pub fn query(&self, query: &IndexQuery) -> Vec<DescriptorRef> {
        let state = self.state.read();
        let mut frontier: Vec<NodeId> = vec![0];

        for indexer in &self.indexers {
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            let keys = indexer.query_keys(query);

            for node in frontier {
                let Node::Branch(branch) = &state.nodes[node] else {
                    continue;
                };
                let mut visit = |child: NodeId| {
                    if seen.insert(child) {
                        next.push(child);
                    }
                };
                match &keys {
                    QueryKeys::All => branch.children.values().for_each(|c| visit(*c)),
                    QueryKeys::Keys(keys) => {
                        for key in keys {
                            if let Some(child) =
                                self.lookup_child(&state, node, indexer.as_ref(), key)
                            {
                                visit(child);
                            }
                        }
                    }
                    QueryKeys::Range { from, to } => {
                        if from <= to {
                            branch
                                .children
                                .range(from.clone()..=to.clone())
                                .for_each(|(_, c)| visit(*c));
                        }
                    }
                }
            }

            if next.is_empty() {
                return Vec::new();
            }
            frontier = next;
        }

        let mut results = Vec::new();
        for node in frontier {
            if let Node::Leaf(leaf) = &state.nodes[node] {
                results.extend(leaf.query(query));
            }
        }
        results
    }

    // ==================== Statistics ====================

    /// Approximate memory held by the whole tree
    pub fn component_size(&self, sizes: &dyn ObjectSizes) -> u64 {
        let state = self.state.read();
        let mut size = sizes.object_header_size()
            + sizes.primitive_types_size(2, 0, 1, 0, 0, 0)
            + sizes.array_size(state.nodes.len() as u64);

        for node in &state.nodes {
            size += match node {
                Node::Branch(branch) => {
                    let len = branch.children.len() as u64;
                    sizes.align_to_8(sizes.object_header_size() + sizes.reference_size())
                        + sizes.hash_map_size(len)
                        + len * sizes.align_to_8(
                            sizes.object_header_size() + sizes.primitive_types_size(1, 0, 0, 0, 1, 0),
                        )
                }
                Node::Leaf(leaf) => leaf.component_size(sizes),
            };
        }
        sizes.align_to_8(size)
    }

    pub fn stats(&self) -> TreeStats {
        let state = self.state.read();
        let mut stats = TreeStats {
            depth: self.indexers.len(),
            ..Default::default()
        };
        for node in &state.nodes {
            match node {
                Node::Branch(_) => stats.branch_count += 1,
                Node::Leaf(leaf) => {
                    stats.leaf_count += 1;
                    stats.descriptor_count += leaf.len();
                }
            }
        }
        stats
    }

    /// Channel ids of all leaves
    pub fn channel_ids(&self) -> Vec<u32> {
        let state = self.state.read();
        state
            .nodes
            .iter()
            .filter_map(|node| match node {
                Node::Leaf(leaf) => Some(leaf.channel_id()),
                Node::Branch(_) => None,
            })
            .collect()
    }

    // ==================== Persistence ====================

    /// Consistent copy of the whole tree
    pub fn snapshot(&self) -> TreeSnapshot {
        let state = self.state.read();
        let nodes = state
            .nodes
            .iter()
            .map(|node| match node {
                Node::Branch(branch) => NodeSnapshot::Branch {
                    children: branch
                        .children
                        .iter()
                        .map(|(key, child)| (key.clone(), *child as u64))
                        .collect(),
                },
                Node::Leaf(leaf) => NodeSnapshot::Leaf {
                    channel_id: leaf.channel_id(),
                    entries: leaf.entries().collect(),
                },
            })
            .collect();

        TreeSnapshot {
            format_version: TREE_FORMAT_VERSION,
            indexer_chain: self.indexer_chain(),
            next_channel_id: state.next_channel_id,
            nodes,
        }
    }

    /// Rebuild a tree from a snapshot taken with the same indexer chain
    pub fn restore(
        snapshot: TreeSnapshot,
        indexers: Vec<Box<dyn BranchIndexer>>,
    ) -> StorageResult<Self> {
        let configured: Vec<String> = indexers.iter().map(|i| i.describe()).collect();
        if snapshot.indexer_chain != configured {
            return Err(StorageError::IndexerChainMismatch {
                persisted: snapshot.indexer_chain,
                configured,
            });
        }
        if snapshot.format_version != TREE_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported tree format version {}",
                snapshot.format_version
            )));
        }
        validate_shape(&snapshot, indexers.len())?;

        let mut nodes = Vec::with_capacity(snapshot.nodes.len());
        for node in snapshot.nodes {
            nodes.push(match node {
                NodeSnapshot::Branch { children } => Node::Branch(Branch {
                    children: children
                        .into_iter()
                        .map(|(key, child)| (key, child as NodeId))
                        .collect(),
                }),
                NodeSnapshot::Leaf {
                    channel_id,
                    entries,
                } => {
                    if channel_id >= snapshot.next_channel_id {
                        return Err(StorageError::Corruption(format!(
                            "Leaf channel {} not below next channel id {}",
                            channel_id, snapshot.next_channel_id
                        )));
                    }
                    Node::Leaf(StorageLeaf::from_entries(channel_id, entries)?)
                }
            });
        }

        Ok(Self {
            indexers,
            state: RwLock::new(TreeState {
                nodes,
                next_channel_id: snapshot.next_channel_id,
            }),
        })
    }
}

/// Every child id is in bounds, branches sit above the last level and leaves on it
fn validate_shape(snapshot: &TreeSnapshot, depth: usize) -> StorageResult<()> {
    if snapshot.nodes.is_empty() {
        return Err(StorageError::Corruption("Tree snapshot has no root".to_string()));
    }
    let mut stack = vec![(0usize, 0usize)];
    let mut visited = HashSet::new();
    while let Some((node, level)) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        match &snapshot.nodes[node] {
            NodeSnapshot::Branch { children } if level < depth => {
                for (_, child) in children {
                    let child = *child as usize;
                    if child >= snapshot.nodes.len() {
                        return Err(StorageError::Corruption(format!(
                            "Child node {} out of bounds",
                            child
                        )));
                    }
                    stack.push((child, level + 1));
                }
            }
            NodeSnapshot::Leaf { .. } if level == depth => {}
            _ => {
                return Err(StorageError::Corruption(format!(
                    "Node {} has the wrong kind for level {}",
                    node, level
                )))
            }
        }
    }
    Ok(())
}

/// Serializable image of an [`IndexingTree`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub format_version: u16,
    pub indexer_chain: Vec<String>,
    pub next_channel_id: u32,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeSnapshot {
    Branch {
        children: Vec<(IndexKey, u64)>,
    },
    Leaf {
        channel_id: u32,
        entries: Vec<(u64, StorageDescriptor)>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::indexer::{
        ObjectTypeIndexer, PlatformIdentIndexer, SensorTypeIdentIndexer, TimestampIndexer,
    };
    use crate::index::record::test_support::TestRecord;
    use crate::index::sizes::ObjectSizes64;
    use chrono::{TimeZone, Utc};

    fn platform_sensor_tree() -> IndexingTree {
        IndexingTree::new(vec![
            Box::new(PlatformIdentIndexer),
            Box::new(SensorTypeIdentIndexer),
        ])
    }

    #[test]
    fn test_routing_is_deterministic() {
        let tree = platform_sensor_tree();

        let a = tree.put(&TestRecord::new(1).platform(1).sensor(2)).unwrap();
        let b = tree.put(&TestRecord::new(2).platform(1).sensor(2)).unwrap();
        let c = tree.put(&TestRecord::new(3).platform(1).sensor(3)).unwrap();

        assert_eq!(a.channel_id(), b.channel_id());
        assert_ne!(a.channel_id(), c.channel_id());

        let stats = tree.stats();
        assert_eq!(stats.leaf_count, 2);
        assert_eq!(stats.descriptor_count, 3);
    }

    #[test]
    fn test_channel_ids_unique_and_monotonic() {
        let tree = platform_sensor_tree();
        let mut channels = Vec::new();
        for platform in 1..=5 {
            let slot = tree.put(&TestRecord::new(platform).platform(platform)).unwrap();
            channels.push(slot.channel_id());
        }
        assert_eq!(channels, vec![1, 2, 3, 4, 5]);
        assert_eq!(tree.next_channel_id(), 6);
    }

    #[test]
    fn test_duplicate_in_same_leaf() {
        let tree = platform_sensor_tree();
        tree.put(&TestRecord::new(7).platform(1)).unwrap();
        let err = tree.put(&TestRecord::new(7).platform(1)).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateId { id: 7, .. }));

        // Same id in a different leaf is fine
        assert!(tree.put(&TestRecord::new(7).platform(2)).is_ok());
    }

    #[test]
    fn test_empty_chain_uses_root_leaf() {
        let tree = IndexingTree::new(Vec::new());
        let slot = tree.put(&TestRecord::new(1)).unwrap();
        assert_eq!(slot.channel_id(), 1);
        assert_eq!(tree.query(&IndexQuery::new()).len(), 1);
    }

    #[test]
    fn test_get_and_remove() {
        let tree = platform_sensor_tree();
        let record = TestRecord::new(1).platform(4).sensor(5);
        let slot = tree.put(&record).unwrap();
        slot.finalize(0, 42);

        assert_eq!(tree.get(&record).unwrap().snapshot().size, 42);
        assert!(tree.get(&TestRecord::new(1).platform(9)).is_none());

        assert!(tree.get_and_remove(&record).is_some());
        assert!(tree.get(&record).is_none());
    }

    #[test]
    fn test_query_unions_branches() {
        let tree = platform_sensor_tree();
        for id in 1..=10 {
            tree.put(&TestRecord::new(id).platform(id % 2 + 1).sensor(id % 3 + 1))
                .unwrap();
        }

        assert_eq!(tree.query(&IndexQuery::new()).len(), 10);
        assert_eq!(tree.query(&IndexQuery::new().platform(1)).len(), 5);
        assert_eq!(tree.query(&IndexQuery::new().sensor_type(1)).len(), 3);
        assert_eq!(tree.query(&IndexQuery::new().platform(2).sensor_type(1)).len(), 2);
        assert_eq!(tree.query(&IndexQuery::new().platform(99)).len(), 0);
        assert_eq!(tree.query(&IndexQuery::new().min_id(6)).len(), 5);
    }

    #[test]
    fn test_object_type_keys_query() {
        let tree = IndexingTree::new(vec![Box::new(ObjectTypeIndexer::new())]);
        tree.put(&TestRecord::new(1).kind("Timer")).unwrap();
        tree.put(&TestRecord::new(2).kind("SqlStatement")).unwrap();
        tree.put(&TestRecord::new(3).kind("Exception")).unwrap();

        let query = IndexQuery::new().object_type("Timer").object_type("Exception");
        assert_eq!(tree.query(&query).len(), 2);

        let mut query = IndexQuery::new();
        query.object_types = Vec::new();
        assert_eq!(tree.query(&query).len(), 3);
    }

    #[test]
    fn test_shared_child_visible_through_both_keys() {
        let tree = IndexingTree::new(vec![Box::new(ObjectTypeIndexer::with_groups(vec![
            vec!["SqlStatement".to_string(), "Exception".to_string()],
        ]))]);

        let sql = tree.put(&TestRecord::new(1).kind("SqlStatement")).unwrap();
        let exception = tree.put(&TestRecord::new(2).kind("Exception")).unwrap();
        assert_eq!(sql.channel_id(), exception.channel_id());

        let through_exception = tree.query(&IndexQuery::new().object_type("Exception"));
        assert_eq!(through_exception.len(), 2);
        let through_sql = tree.query(&IndexQuery::new().object_type("SqlStatement"));
        assert_eq!(through_sql.len(), 2);

        assert_eq!(tree.stats().leaf_count, 1);
    }

    #[test]
    fn test_shared_child_created_through_member() {
        let tree = IndexingTree::new(vec![Box::new(ObjectTypeIndexer::with_groups(vec![
            vec!["SqlStatement".to_string(), "Exception".to_string()],
        ]))]);

        tree.put(&TestRecord::new(1).kind("Exception")).unwrap();
        let found = tree.get(&TestRecord::new(1).kind("SqlStatement"));
        assert!(found.is_some());
    }

    #[test]
    fn test_timestamp_range_query() {
        let tree = IndexingTree::new(vec![Box::new(TimestampIndexer::new(1_000))]);
        for id in 1..=10 {
            tree.put(&TestRecord::new(id).at(id as i64 * 1_000)).unwrap();
        }

        let from = Utc.timestamp_millis_opt(3_000).unwrap();
        let to = Utc.timestamp_millis_opt(5_500).unwrap();
        assert_eq!(tree.query(&IndexQuery::new().interval(from, to)).len(), 3);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let tree = platform_sensor_tree();
        let mut records = Vec::new();
        for id in 1..=20 {
            let record = TestRecord::new(id).platform(id % 3).sensor(id % 2);
            let slot = tree.put(&record).unwrap();
            if id % 4 != 0 {
                slot.finalize(id * 100, 50);
            }
            records.push(record);
        }

        let snapshot = tree.snapshot();
        let bytes = bincode::serialize(&snapshot).unwrap();
        let decoded: TreeSnapshot = bincode::deserialize(&bytes).unwrap();

        let restored = IndexingTree::restore(
            decoded,
            vec![Box::new(PlatformIdentIndexer), Box::new(SensorTypeIdentIndexer)],
        )
        .unwrap();

        for record in &records {
            assert_eq!(
                tree.get(record).map(|s| s.snapshot()),
                restored.get(record).map(|s| s.snapshot())
            );
        }
        let original: Vec<_> = tree
            .query(&IndexQuery::new().platform(1))
            .iter()
            .map(|s| s.snapshot())
            .collect();
        let after: Vec<_> = restored
            .query(&IndexQuery::new().platform(1))
            .iter()
            .map(|s| s.snapshot())
            .collect();
        assert_eq!(original, after);
        assert_eq!(restored.next_channel_id(), tree.next_channel_id());

        // Unset descriptors can still be finalized after restore
        let unset = restored.get(&records[3]).unwrap();
        assert!(!unset.is_finalized());
        assert!(unset.finalize(1, 1));
    }

    #[test]
    fn test_restore_rejects_other_chain() {
        let tree = platform_sensor_tree();
        tree.put(&TestRecord::new(1)).unwrap();

        let err = IndexingTree::restore(tree.snapshot(), vec![Box::new(PlatformIdentIndexer)])
            .unwrap_err();
        assert!(matches!(err, StorageError::IndexerChainMismatch { .. }));
    }

    #[test]
    fn test_restore_rejects_bad_child() {
        let tree = platform_sensor_tree();
        tree.put(&TestRecord::new(1)).unwrap();
        let mut snapshot = tree.snapshot();
        snapshot.nodes[0] = NodeSnapshot::Branch {
            children: vec![(IndexKey::Int(0), 99)],
        };

        let err = IndexingTree::restore(
            snapshot,
            vec![Box::new(PlatformIdentIndexer), Box::new(SensorTypeIdentIndexer)],
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_component_size_grows() {
        let tree = platform_sensor_tree();
        let sizes = ObjectSizes64;
        let empty = tree.component_size(&sizes);
        for id in 1..=100 {
            tree.put(&TestRecord::new(id).platform(id % 10)).unwrap();
        }
        assert!(tree.component_size(&sizes) > empty);
    }
}
