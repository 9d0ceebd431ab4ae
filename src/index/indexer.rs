//! Branch indexers
//!
//! Each level of the indexing tree is bound to one [`BranchIndexer`]. The
//! indexer computes the routing key for an element on insert and the set of
//! candidate keys for a query. The ordered chain of indexers is fixed for the
//! lifetime of a tree and is part of its persisted identity.

use crate::index::query::IndexQuery;
use crate::index::record::IndexedData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing key of one branch level
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Int(i64),
    Name(String),
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Int(v) => write!(f, "{}", v),
            IndexKey::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Keys a query descends into at one level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKeys {
    /// No constraint, fan out to every child
    All,
    /// Only these keys. Empty matches nothing.
    Keys(Vec<IndexKey>),
    /// Every key in `[from, to]`
    Range { from: IndexKey, to: IndexKey },
}

/// Key extraction strategy for one tree level
pub trait BranchIndexer: Send + Sync + fmt::Debug {
    /// Routing key for an element. Must be a pure function of the element.
    fn key(&self, element: &dyn IndexedData) -> IndexKey;

    /// Candidate keys for a query
    fn query_keys(&self, query: &IndexQuery) -> QueryKeys;

    /// Whether several keys may resolve to one physical child
    fn shared_instance(&self) -> bool {
        false
    }

    /// Key of the child a shared key collapses into
    fn shared_bucket(&self, key: &IndexKey) -> IndexKey {
        key.clone()
    }

    /// Stable description used as the indexer's identity in persisted trees
    fn describe(&self) -> String;
}

fn ident_keys(value: u64) -> QueryKeys {
    if value == 0 {
        QueryKeys::All
    } else {
        QueryKeys::Keys(vec![IndexKey::Int(value as i64)])
    }
}

/// Routes on the platform (agent) id
#[derive(Debug, Clone, Default)]
pub struct PlatformIdentIndexer;

impl BranchIndexer for PlatformIdentIndexer {
    fn key(&self, element: &dyn IndexedData) -> IndexKey {
        IndexKey::Int(element.platform_ident() as i64)
    }

    fn query_keys(&self, query: &IndexQuery) -> QueryKeys {
        ident_keys(query.platform_ident)
    }

    fn describe(&self) -> String {
        "platform_ident".to_string()
    }
}

/// Routes on the sensor type id
#[derive(Debug, Clone, Default)]
pub struct SensorTypeIdentIndexer;

impl BranchIndexer for SensorTypeIdentIndexer {
    fn key(&self, element: &dyn IndexedData) -> IndexKey {
        IndexKey::Int(element.sensor_type_ident() as i64)
    }

    fn query_keys(&self, query: &IndexQuery) -> QueryKeys {
        ident_keys(query.sensor_type_ident)
    }

    fn describe(&self) -> String {
        "sensor_type_ident".to_string()
    }
}

/// Routes on the method id; records without one go to key `0`
#[derive(Debug, Clone, Default)]
pub struct MethodIdentIndexer;

impl BranchIndexer for MethodIdentIndexer {
    fn key(&self, element: &dyn IndexedData) -> IndexKey {
        IndexKey::Int(element.method_ident().unwrap_or(0) as i64)
    }

    fn query_keys(&self, query: &IndexQuery) -> QueryKeys {
        ident_keys(query.method_ident)
    }

    fn describe(&self) -> String {
        "method_ident".to_string()
    }
}

/// Routes on the runtime type name
///
/// Type names listed together in one group share a single physical child,
/// keyed by the first name of the group.
#[derive(Debug, Clone, Default)]
pub struct ObjectTypeIndexer {
    groups: Vec<Vec<String>>,
}

impl ObjectTypeIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: Vec<Vec<String>>) -> Self {
        Self {
            groups: groups.into_iter().filter(|g| !g.is_empty()).collect(),
        }
    }
}

impl BranchIndexer for ObjectTypeIndexer {
    fn key(&self, element: &dyn IndexedData) -> IndexKey {
        IndexKey::Name(element.type_name().to_string())
    }

    fn query_keys(&self, query: &IndexQuery) -> QueryKeys {
        if query.object_types.is_empty() {
            return QueryKeys::All;
        }
        QueryKeys::Keys(
            query
                .object_types
                .iter()
                .map(|t| IndexKey::Name(t.clone()))
                .collect(),
        )
    }

    fn shared_instance(&self) -> bool {
        true
    }

    fn shared_bucket(&self, key: &IndexKey) -> IndexKey {
        if let IndexKey::Name(name) = key {
            for group in &self.groups {
                if group.iter().any(|member| member == name) {
                    return IndexKey::Name(group[0].clone());
                }
            }
        }
        key.clone()
    }

    fn describe(&self) -> String {
        if self.groups.is_empty() {
            "object_type".to_string()
        } else {
            let groups: Vec<String> = self.groups.iter().map(|g| g.join("|")).collect();
            format!("object_type[{}]", groups.join(","))
        }
    }
}

/// Routes on the capture time, bucketed by `bucket_millis`
#[derive(Debug, Clone)]
pub struct TimestampIndexer {
    bucket_millis: i64,
}

impl TimestampIndexer {
    pub fn new(bucket_millis: i64) -> Self {
        Self {
            bucket_millis: bucket_millis.max(1),
        }
    }

    fn bucket(&self, millis: i64) -> i64 {
        millis.div_euclid(self.bucket_millis)
    }
}

impl BranchIndexer for TimestampIndexer {
    fn key(&self, element: &dyn IndexedData) -> IndexKey {
        IndexKey::Int(element.timestamp_millis().map_or(0, |ts| self.bucket(ts)))
    }

    fn query_keys(&self, query: &IndexQuery) -> QueryKeys {
        match query.interval_millis() {
            Some((from, to)) => QueryKeys::Range {
                from: IndexKey::Int(self.bucket(from)),
                to: IndexKey::Int(self.bucket(to)),
            },
            None => QueryKeys::All,
        }
    }

    fn describe(&self) -> String {
        format!("timestamp[{}]", self.bucket_millis)
    }
}

/// Routes on a CRC32 hash of the free-text content
///
/// `max_keys <= 0` keeps the raw hash as key.
#[derive(Debug, Clone)]
pub struct ContentHashIndexer {
    max_keys: i64,
}

impl ContentHashIndexer {
    pub fn new(max_keys: i64) -> Self {
        Self { max_keys }
    }

    fn hash_key(&self, content: &str) -> i64 {
        let hash = crc32fast::hash(content.as_bytes()) as i64;
        if self.max_keys > 0 {
            hash % self.max_keys
        } else {
            hash
        }
    }
}

impl BranchIndexer for ContentHashIndexer {
    fn key(&self, element: &dyn IndexedData) -> IndexKey {
        IndexKey::Int(element.content().map_or(0, |c| self.hash_key(c)))
    }

    fn query_keys(&self, query: &IndexQuery) -> QueryKeys {
        match &query.sql {
            Some(sql) => QueryKeys::Keys(vec![IndexKey::Int(self.hash_key(sql))]),
            None => QueryKeys::All,
        }
    }

    fn describe(&self) -> String {
        format!("content_hash[{}]", self.max_keys)
    }
}

/// Serializable description of one indexer in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexerSpec {
    PlatformIdent,
    SensorTypeIdent,
    MethodIdent,
    ObjectType {
        #[serde(default)]
        groups: Vec<Vec<String>>,
    },
    Timestamp {
        bucket_millis: i64,
    },
    ContentHash {
        #[serde(default)]
        max_keys: i64,
    },
}

impl IndexerSpec {
    pub fn build(&self) -> Box<dyn BranchIndexer> {
        match self {
            IndexerSpec::PlatformIdent => Box::new(PlatformIdentIndexer),
            IndexerSpec::SensorTypeIdent => Box::new(SensorTypeIdentIndexer),
            IndexerSpec::MethodIdent => Box::new(MethodIdentIndexer),
            IndexerSpec::ObjectType { groups } => {
                Box::new(ObjectTypeIndexer::with_groups(groups.clone()))
            }
            IndexerSpec::Timestamp { bucket_millis } => {
                Box::new(TimestampIndexer::new(*bucket_millis))
            }
            IndexerSpec::ContentHash { max_keys } => Box::new(ContentHashIndexer::new(*max_keys)),
        }
    }

    /// Platform, object type, sensor type, method, hourly timestamp
    pub fn default_chain() -> Vec<IndexerSpec> {
        vec![
            IndexerSpec::PlatformIdent,
            IndexerSpec::ObjectType { groups: Vec::new() },
            IndexerSpec::SensorTypeIdent,
            IndexerSpec::MethodIdent,
            IndexerSpec::Timestamp {
                bucket_millis: 3_600_000,
            },
        ]
    }

    pub fn build_chain(specs: &[IndexerSpec]) -> Vec<Box<dyn BranchIndexer>> {
        specs.iter().map(|s| s.build()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::record::test_support::TestRecord;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_identifier_routing() {
        let record = TestRecord::new(1).platform(7).sensor(3);

        assert_eq!(PlatformIdentIndexer.key(&record), IndexKey::Int(7));
        assert_eq!(SensorTypeIdentIndexer.key(&record), IndexKey::Int(3));
        // No method id routes to 0
        assert_eq!(MethodIdentIndexer.key(&record), IndexKey::Int(0));

        assert_eq!(PlatformIdentIndexer.query_keys(&IndexQuery::new()), QueryKeys::All);
        assert_eq!(
            PlatformIdentIndexer.query_keys(&IndexQuery::new().platform(7)),
            QueryKeys::Keys(vec![IndexKey::Int(7)])
        );
    }

    #[test]
    fn test_object_type_groups() {
        let indexer = ObjectTypeIndexer::with_groups(vec![vec![
            "SqlStatement".to_string(),
            "Exception".to_string(),
        ]]);

        assert!(indexer.shared_instance());
        assert_eq!(
            indexer.shared_bucket(&IndexKey::Name("Exception".to_string())),
            IndexKey::Name("SqlStatement".to_string())
        );
        assert_eq!(
            indexer.shared_bucket(&IndexKey::Name("Timer".to_string())),
            IndexKey::Name("Timer".to_string())
        );

        let query = IndexQuery::new().object_type("Timer");
        assert_eq!(
            indexer.query_keys(&query),
            QueryKeys::Keys(vec![IndexKey::Name("Timer".to_string())])
        );
    }

    #[test]
    fn test_timestamp_buckets() {
        let indexer = TimestampIndexer::new(1_000);

        assert_eq!(indexer.key(&TestRecord::new(1).at(2_500)), IndexKey::Int(2));
        assert_eq!(indexer.key(&TestRecord::new(1).at(-1)), IndexKey::Int(-1));
        assert_eq!(indexer.key(&TestRecord::new(1)), IndexKey::Int(0));

        let from = Utc.timestamp_millis_opt(1_200).unwrap();
        let to = Utc.timestamp_millis_opt(4_100).unwrap();
        assert_eq!(
            indexer.query_keys(&IndexQuery::new().interval(from, to)),
            QueryKeys::Range {
                from: IndexKey::Int(1),
                to: IndexKey::Int(4)
            }
        );
        // Inverted interval is not set
        assert_eq!(
            indexer.query_keys(&IndexQuery::new().interval(to, from)),
            QueryKeys::All
        );
    }

    #[test]
    fn test_content_hash_bounded() {
        let indexer = ContentHashIndexer::new(10);
        let record = TestRecord::new(1).content("SELECT * FROM orders");

        let key = indexer.key(&record);
        match &key {
            IndexKey::Int(v) => assert!((0..10).contains(v)),
            other => panic!("unexpected key {:?}", other),
        }

        let query = IndexQuery::new().sql("SELECT * FROM orders");
        assert_eq!(indexer.query_keys(&query), QueryKeys::Keys(vec![key]));
        assert_eq!(indexer.key(&TestRecord::new(2)), IndexKey::Int(0));
    }

    #[test]
    fn test_spec_toml_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Chain {
            indexers: Vec<IndexerSpec>,
        }

        let chain = Chain {
            indexers: IndexerSpec::default_chain(),
        };
        let text = toml::to_string(&chain).unwrap();
        let parsed: Chain = toml::from_str(&text).unwrap();
        assert_eq!(parsed.indexers, IndexerSpec::default_chain());

        let described: Vec<String> = IndexerSpec::build_chain(&parsed.indexers)
            .iter()
            .map(|i| i.describe())
            .collect();
        assert_eq!(described[4], "timestamp[3600000]");
    }
}
