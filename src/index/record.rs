//! Indexed data abstraction
//!
//! The indexing tree never sees concrete record types. It routes and
//! addresses records through this trait only, so any monitoring record that
//! can report its identity and a few routing attributes can be stored.

use crate::index::query::RecordField;

/// View of a monitoring record used for indexing
pub trait IndexedData: Send + Sync {
    /// Monotonically assigned record id (unique within a leaf)
    fn id(&self) -> u64;

    /// Id of the agent platform the record was captured on
    fn platform_ident(&self) -> u64;

    /// Id of the sensor type that produced the record
    fn sensor_type_ident(&self) -> u64;

    /// Id of the instrumented method, if the record is method-bound
    fn method_ident(&self) -> Option<u64> {
        None
    }

    /// Capture time in milliseconds since the Unix epoch
    fn timestamp_millis(&self) -> Option<i64>;

    /// Name of the concrete record type (e.g. "SqlStatement")
    fn type_name(&self) -> &str;

    /// Free-text content used for hashing (e.g. SQL text)
    fn content(&self) -> Option<&str> {
        None
    }

    /// Numeric value of a field, used by query restrictions
    fn field(&self, field: RecordField) -> Option<i64> {
        match field {
            RecordField::Id => Some(self.id() as i64),
            RecordField::PlatformIdent => Some(self.platform_ident() as i64),
            RecordField::SensorTypeIdent => Some(self.sensor_type_ident() as i64),
            RecordField::MethodIdent => self.method_ident().map(|m| m as i64),
            RecordField::Timestamp => self.timestamp_millis(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal record for index tests
    #[derive(Debug, Clone, Default)]
    pub struct TestRecord {
        pub id: u64,
        pub platform_ident: u64,
        pub sensor_type_ident: u64,
        pub method_ident: Option<u64>,
        pub timestamp: Option<i64>,
        pub type_name: String,
        pub content: Option<String>,
    }

    impl TestRecord {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                type_name: "Timer".to_string(),
                ..Default::default()
            }
        }

        pub fn platform(mut self, platform_ident: u64) -> Self {
            self.platform_ident = platform_ident;
            self
        }

        pub fn sensor(mut self, sensor_type_ident: u64) -> Self {
            self.sensor_type_ident = sensor_type_ident;
            self
        }

        pub fn method(mut self, method_ident: u64) -> Self {
            self.method_ident = Some(method_ident);
            self
        }

        pub fn at(mut self, timestamp: i64) -> Self {
            self.timestamp = Some(timestamp);
            self
        }

        pub fn kind(mut self, type_name: &str) -> Self {
            self.type_name = type_name.to_string();
            self
        }

        pub fn content(mut self, content: &str) -> Self {
            self.content = Some(content.to_string());
            self
        }
    }

    impl IndexedData for TestRecord {
        fn id(&self) -> u64 {
            self.id
        }

        fn platform_ident(&self) -> u64 {
            self.platform_ident
        }

        fn sensor_type_ident(&self) -> u64 {
            self.sensor_type_ident
        }

        fn method_ident(&self) -> Option<u64> {
            self.method_ident
        }

        fn timestamp_millis(&self) -> Option<i64> {
            self.timestamp
        }

        fn type_name(&self) -> &str {
            &self.type_name
        }

        fn content(&self) -> Option<&str> {
            self.content.as_deref()
        }
    }
}
