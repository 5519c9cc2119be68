//! Telemetry sink abstraction
//!
//! Handlers and workers build [`Point`] values and hand them to a
//! [`TelemetrySink`]. Writes are fire-and-forget: a failing sink logs and
//! drops, it never stalls the stream.

mod influx;

pub use influx::InfluxSink;

use async_trait::async_trait;

/// A single field value on a point
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),

    /// 64-bit signed integer
    Integer(i64),

    /// Boolean
    Boolean(bool),

    /// UTF-8 text
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One measurement sample bound for the time-series store
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Measurement name
    pub measurement: &'static str,

    /// Indexed tag set, in insertion order
    pub tags: Vec<(&'static str, String)>,

    /// Field set, in insertion order
    pub fields: Vec<(String, FieldValue)>,

    /// Epoch seconds
    pub timestamp: i64,
}

impl Point {
    /// Start a point for `measurement` stamped at `timestamp` epoch seconds
    #[must_use]
    pub fn new(measurement: &'static str, timestamp: i64) -> Self {
        Self {
            measurement,
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    /// Add a tag; empty values are dropped since the store rejects them
    #[must_use]
    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.tags.push((key, value));
        }
        self
    }

    /// Add a tag when present
    #[must_use]
    pub fn maybe_tag(self, key: &'static str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.tag(key, value),
            None => self,
        }
    }

    /// Add a field
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Add a field when present
    #[must_use]
    pub fn maybe_field<V: Into<FieldValue>>(
        self,
        key: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    /// Whether the point carries at least one field
    #[must_use]
    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// Destination for measurement points
///
/// Implementations buffer internally and absorb their own failures; a write
/// error is logged at the sink, never surfaced to the producer.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Queue points for delivery
    async fn write_points(&self, points: Vec<Point>);

    /// Drain anything buffered; called once on shutdown
    async fn flush(&self) {}
}
