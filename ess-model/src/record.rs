use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scalar value carried in a record. The Python reference mixes floats,
/// ints, strings and timestamps freely in the same dict; this enum models
/// that directly rather than collapsing everything to `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Str(String),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// A partial measurement pushed onto the response queue by a single
/// instrument worker. Always carries a `timestamp`; everything else is
/// instrument-specific.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialRecord {
    pub fields: HashMap<String, FieldValue>,
}

impl PartialRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp(timestamp: DateTime<Utc>) -> Self {
        let mut fields = HashMap::new();
        fields.insert("timestamp".to_string(), FieldValue::Timestamp(timestamp));
        Self { fields }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Extracts and removes the mandatory `timestamp` field. Mirrors
    /// `newrec.pop('timestamp')` in the aggregator merge loop: a record
    /// without one is malformed and must be discarded by the caller.
    pub fn take_timestamp(&mut self) -> Option<DateTime<Utc>> {
        match self.fields.remove("timestamp") {
            Some(FieldValue::Timestamp(ts)) => Some(ts),
            _ => None,
        }
    }

    /// Extracts the optional `log_timeout` override (seconds).
    pub fn take_log_timeout(&mut self) -> Option<i64> {
        match self.fields.remove("log_timeout") {
            Some(FieldValue::Int(v)) => Some(v),
            Some(FieldValue::Float(v)) => Some(v as i64),
            _ => None,
        }
    }

    /// Closes this partial out into a full record once its aggregation
    /// deadline has passed.
    pub fn into_full(self, timestamp: DateTime<Utc>) -> FullRecord {
        FullRecord {
            timestamp,
            fields: self.fields,
        }
    }
}

/// The union of all partial records sharing a timestamp, closed once the
/// aggregation deadline for that timestamp has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, FieldValue>,
}

impl FullRecord {
    /// Reinserts `timestamp` as a field, for sinks that only know how to
    /// write a [`PartialRecord`].
    pub fn into_partial(self) -> PartialRecord {
        let mut fields = self.fields;
        fields.insert("timestamp".to_string(), FieldValue::Timestamp(self.timestamp));
        PartialRecord { fields }
    }
}
