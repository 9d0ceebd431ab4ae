//! Core data types for monitoring record storage
//!
//! This module defines the records written to channel files:
//! - `MonitoringRecord`: One captured measurement with its identity
//! - `RecordPayload`: What was captured (timer, SQL, exception, ...)

use crate::index::IndexedData;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One monitoring record as captured by an agent
///
/// The id is assigned upstream and must be unique per leaf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringRecord {
    /// Upstream assigned record id
    pub id: u64,
    /// Agent platform the record was captured on
    pub platform_ident: u64,
    /// Sensor that produced the record
    pub sensor_type_ident: u64,
    /// Instrumented method, if any
    #[serde(default)]
    pub method_ident: Option<u64>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Captured data
    pub payload: RecordPayload,
}

/// Captured data of a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RecordPayload {
    /// Plain method timing
    Timer { duration_ms: f64 },
    /// Executed SQL statement
    SqlStatement { sql: String, duration_ms: f64 },
    /// Thrown exception
    Exception { class_name: String, message: String },
    /// Timed HTTP request
    HttpTimer {
        uri: String,
        method: String,
        duration_ms: f64,
    },
    /// Root of a recorded invocation tree
    InvocationSequence { child_count: u32, duration_ms: f64 },
}

impl RecordPayload {
    /// Name of the payload variant
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordPayload::Timer { .. } => "Timer",
            RecordPayload::SqlStatement { .. } => "SqlStatement",
            RecordPayload::Exception { .. } => "Exception",
            RecordPayload::HttpTimer { .. } => "HttpTimer",
            RecordPayload::InvocationSequence { .. } => "InvocationSequence",
        }
    }

    /// Duration, if the payload is timed
    pub fn duration_ms(&self) -> Option<f64> {
        match self {
            RecordPayload::Timer { duration_ms }
            | RecordPayload::SqlStatement { duration_ms, .. }
            | RecordPayload::HttpTimer { duration_ms, .. }
            | RecordPayload::InvocationSequence { duration_ms, .. } => Some(*duration_ms),
            RecordPayload::Exception { .. } => None,
        }
    }
}

impl MonitoringRecord {
    /// Create a record with the current timestamp
    pub fn new(id: u64, payload: RecordPayload) -> Self {
        Self {
            id,
            platform_ident: 0,
            sensor_type_ident: 0,
            method_ident: None,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Timer record
    pub fn timer(id: u64, duration_ms: f64) -> Self {
        Self::new(id, RecordPayload::Timer { duration_ms })
    }

    /// SQL statement record
    pub fn sql(id: u64, sql: impl Into<String>, duration_ms: f64) -> Self {
        Self::new(
            id,
            RecordPayload::SqlStatement {
                sql: sql.into(),
                duration_ms,
            },
        )
    }

    /// Exception record
    pub fn exception(id: u64, class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            id,
            RecordPayload::Exception {
                class_name: class_name.into(),
                message: message.into(),
            },
        )
    }

    /// HTTP timer record
    pub fn http(id: u64, uri: impl Into<String>, method: impl Into<String>, duration_ms: f64) -> Self {
        Self::new(
            id,
            RecordPayload::HttpTimer {
                uri: uri.into(),
                method: method.into(),
                duration_ms,
            },
        )
    }

    /// Builder method: set platform
    pub fn platform(mut self, platform_ident: u64) -> Self {
        self.platform_ident = platform_ident;
        self
    }

    /// Builder method: set sensor type
    pub fn sensor_type(mut self, sensor_type_ident: u64) -> Self {
        self.sensor_type_ident = sensor_type_ident;
        self
    }

    /// Builder method: set method
    pub fn method(mut self, method_ident: u64) -> Self {
        self.method_ident = Some(method_ident);
        self
    }

    /// Builder method: set timestamp
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl IndexedData for MonitoringRecord {
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
        Some(self.timestamp)
    }

    fn type_name(&self) -> &str {
        self.payload.type_name()
    }

    fn content(&self) -> Option<&str> {
        match &self.payload {
            RecordPayload::SqlStatement { sql, .. } => Some(sql),
            _ => None,
        }
    }
}
