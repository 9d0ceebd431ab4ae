//! Index queries
//!
//! An [`IndexQuery`] narrows the indexing tree down to candidate descriptors.
//! Identifier, type and content fields steer which branches are explored; the
//! id bounds and id sets are applied in the leaves. The time interval and the
//! [`IndexingRestriction`]s are evaluated again against the decoded records.

use crate::index::record::IndexedData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Numeric record fields that restrictions can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordField {
    Id,
    PlatformIdent,
    SensorTypeIdent,
    MethodIdent,
    Timestamp,
}

/// Comparison applied by a restriction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestrictionOp {
    Equal(i64),
    NotEqual(i64),
    Greater(i64),
    GreaterOrEqual(i64),
    Less(i64),
    LessOrEqual(i64),
    In(Vec<i64>),
    IsNull,
    IsNotNull,
}

/// Predicate over one record field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingRestriction {
    pub field: RecordField,
    pub op: RestrictionOp,
}

impl IndexingRestriction {
    pub fn new(field: RecordField, op: RestrictionOp) -> Self {
        Self { field, op }
    }

    pub fn equal(field: RecordField, value: i64) -> Self {
        Self::new(field, RestrictionOp::Equal(value))
    }

    pub fn greater_or_equal(field: RecordField, value: i64) -> Self {
        Self::new(field, RestrictionOp::GreaterOrEqual(value))
    }

    pub fn less_or_equal(field: RecordField, value: i64) -> Self {
        Self::new(field, RestrictionOp::LessOrEqual(value))
    }

    /// Evaluate against a record. Comparisons on a missing value never match.
    pub fn matches(&self, record: &dyn IndexedData) -> bool {
        let value = record.field(self.field);
        match (&self.op, value) {
            (RestrictionOp::IsNull, v) => v.is_none(),
            (RestrictionOp::IsNotNull, v) => v.is_some(),
            (_, None) => false,
            (RestrictionOp::Equal(x), Some(v)) => v == *x,
            (RestrictionOp::NotEqual(x), Some(v)) => v != *x,
            (RestrictionOp::Greater(x), Some(v)) => v > *x,
            (RestrictionOp::GreaterOrEqual(x), Some(v)) => v >= *x,
            (RestrictionOp::Less(x), Some(v)) => v < *x,
            (RestrictionOp::LessOrEqual(x), Some(v)) => v <= *x,
            (RestrictionOp::In(values), Some(v)) => values.contains(&v),
        }
    }
}

/// Selection criteria for the indexing tree
///
/// Identifier fields use `0` for "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexQuery {
    /// Only ids `>= min_id` are returned
    pub min_id: u64,
    pub platform_ident: u64,
    pub sensor_type_ident: u64,
    pub method_ident: u64,
    /// Requested runtime type names; empty means all
    pub object_types: Vec<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub restrictions: Vec<IndexingRestriction>,
    /// Free-text content resolved by the content hash indexer
    pub sql: Option<String>,
    /// When present, only these ids are returned
    pub include_ids: Option<HashSet<u64>>,
    /// Ids that are never returned
    pub exclude_ids: Option<HashSet<u64>>,
}

impl IndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_id(mut self, min_id: u64) -> Self {
        self.min_id = min_id;
        self
    }

    pub fn platform(mut self, platform_ident: u64) -> Self {
        self.platform_ident = platform_ident;
        self
    }

    pub fn sensor_type(mut self, sensor_type_ident: u64) -> Self {
        self.sensor_type_ident = sensor_type_ident;
        self
    }

    pub fn method(mut self, method_ident: u64) -> Self {
        self.method_ident = method_ident;
        self
    }

    pub fn object_type(mut self, type_name: impl Into<String>) -> Self {
        self.object_types.push(type_name.into());
        self
    }

    pub fn interval(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from_date = Some(from);
        self.to_date = Some(to);
        self
    }

    pub fn restriction(mut self, restriction: IndexingRestriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn include_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.include_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn exclude_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.exclude_ids = Some(ids.into_iter().collect());
        self
    }

    /// True only if both bounds are present and `to > from`
    pub fn is_interval_set(&self) -> bool {
        match (self.from_date, self.to_date) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    /// Interval bounds in epoch milliseconds, if set
    pub fn interval_millis(&self) -> Option<(i64, i64)> {
        if !self.is_interval_set() {
            return None;
        }
        match (self.from_date, self.to_date) {
            (Some(from), Some(to)) => Some((from.timestamp_millis(), to.timestamp_millis())),
            _ => None,
        }
    }

    /// Whether an id passes the id bounds and sets
    pub fn accepts_id(&self, id: u64) -> bool {
        if id < self.min_id {
            return false;
        }
        if let Some(exclude) = &self.exclude_ids {
            if exclude.contains(&id) {
                return false;
            }
        }
        match &self.include_ids {
            Some(include) => include.contains(&id),
            None => true,
        }
    }

    /// Exact check of a decoded record against types, content, interval and
    /// restrictions
    ///
    /// Shared tree children may hold several types and content hash buckets
    /// several statements, so both are checked again here.
    pub fn matches_record(&self, record: &dyn IndexedData) -> bool {
        if !self.object_types.is_empty()
            && !self.object_types.iter().any(|t| t == record.type_name())
        {
            return false;
        }
        if let Some(sql) = &self.sql {
            if record.content() != Some(sql.as_str()) {
                return false;
            }
        }
        if let Some((from, to)) = self.interval_millis() {
            match record.timestamp_millis() {
                Some(ts) if ts >= from && ts <= to => {}
                _ => return false,
            }
        }
        self.restrictions.iter().all(|r| r.matches(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::record::test_support::TestRecord;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_interval_requires_both_bounds() {
        let now = Utc::now();

        let mut query = IndexQuery::new();
        assert!(!query.is_interval_set());

        query.from_date = Some(now);
        assert!(!query.is_interval_set());

        let query = IndexQuery::new().interval(now, now);
        assert!(!query.is_interval_set());

        let query = IndexQuery::new().interval(now, now + Duration::seconds(1));
        assert!(query.is_interval_set());
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let query = IndexQuery::new().include_ids([1, 2, 3]).exclude_ids([2]);

        assert!(query.accepts_id(1));
        assert!(!query.accepts_id(2));
        assert!(!query.accepts_id(4));
    }

    #[test]
    fn test_restrictions() {
        let record = TestRecord::new(10).platform(3).at(5_000);

        assert!(IndexingRestriction::equal(RecordField::PlatformIdent, 3).matches(&record));
        assert!(!IndexingRestriction::equal(RecordField::PlatformIdent, 4).matches(&record));
        assert!(IndexingRestriction::greater_or_equal(RecordField::Id, 10).matches(&record));
        assert!(IndexingRestriction::new(RecordField::MethodIdent, RestrictionOp::IsNull)
            .matches(&record));
        assert!(!IndexingRestriction::new(RecordField::MethodIdent, RestrictionOp::Less(100))
            .matches(&record));
        assert!(
            IndexingRestriction::new(RecordField::Timestamp, RestrictionOp::In(vec![1, 5_000]))
                .matches(&record)
        );
    }

    #[test]
    fn test_matches_record_interval() {
        let from = Utc.timestamp_millis_opt(1_000).unwrap();
        let to = Utc.timestamp_millis_opt(2_000).unwrap();
        let query = IndexQuery::new().interval(from, to);

        assert!(query.matches_record(&TestRecord::new(1).at(1_500)));
        assert!(query.matches_record(&TestRecord::new(1).at(2_000)));
        assert!(!query.matches_record(&TestRecord::new(1).at(2_001)));
        assert!(!query.matches_record(&TestRecord::new(1)));
    }

    #[test]
    fn test_matches_record_sql_text() {
        let query = IndexQuery::new().sql("SELECT a FROM t");

        assert!(query.matches_record(&TestRecord::new(1).content("SELECT a FROM t")));
        assert!(!query.matches_record(&TestRecord::new(2).content("DELETE FROM t")));
        assert!(!query.matches_record(&TestRecord::new(3)));

        // No text requested, no text constraint
        assert!(IndexQuery::new().matches_record(&TestRecord::new(3)));
    }
}
