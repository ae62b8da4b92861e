//! Statistics data model.
//!
//! A [`Stat`] is the unit returned by a cluster statistics query. Derived
//! statistics computed by this library reuse the same struct so that a
//! downstream processor cannot tell raw and derived values apart.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A statistic value as returned by the cluster statistics API.
///
/// Values are scalars, ordered sequences, or string-keyed mappings, nested
/// arbitrarily. Variant order matters for untagged deserialization: integers
/// must be tried before floats.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<StatValue>),
    Map(BTreeMap<String, StatValue>),
}

impl StatValue {
    /// Numeric view of the value. `Null` and non-numeric variants yield
    /// `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatValue::Int(v) => Some(*v as f64),
            StatValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Parses a string as a literal value (number, boolean, sequence,
    /// mapping). Returns `None` when the string is not a literal, in which
    /// case callers keep the original string.
    ///
    /// This is a literal parser only, never expression evaluation.
    pub fn parse_literal(text: &str) -> Option<StatValue> {
        serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .map(StatValue::from)
    }
}

impl From<serde_json::Value> for StatValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StatValue::Null,
            serde_json::Value::Bool(b) => StatValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => StatValue::Int(i),
                None => StatValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => StatValue::Str(s),
            serde_json::Value::Array(items) => {
                StatValue::List(items.into_iter().map(StatValue::from).collect())
            }
            serde_json::Value::Object(map) => StatValue::Map(
                map.into_iter().map(|(k, v)| (k, StatValue::from(v))).collect(),
            ),
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("null"),
        }
    }
}

/// One statistic sample. `devid` 0 means cluster-level, anything greater is
/// a node number. Exactly one of `value` and `error` is meaningful;
/// consumers must skip stats that carry an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub key: String,
    #[serde(default)]
    pub devid: i64,
    /// Sample time, unix seconds.
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub value: StatValue,
    #[serde(default)]
    pub error: Option<String>,
}

impl Stat {
    pub fn new(key: impl Into<String>, devid: i64, time: i64, value: StatValue) -> Self {
        Stat {
            key: key.into(),
            devid,
            time,
            value,
            error: None,
        }
    }

    pub fn with_error(key: impl Into<String>, devid: i64, error: impl Into<String>) -> Self {
        Stat {
            key: key.into(),
            devid,
            time: 0,
            value: StatValue::Null,
            error: Some(error.into()),
        }
    }

    /// The value's data type varies per key and some keys arrive as strings
    /// encoding a literal. Convert those in place before handing the stat to
    /// a processor; strings that are not literals are kept as-is.
    pub fn prep_value(&mut self) {
        if let StatValue::Str(text) = &self.value
            && let Some(parsed) = StatValue::parse_literal(text)
        {
            self.value = parsed;
        }
    }
}

/// A server-side refresh policy for one statistic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Refresh period, seconds.
    pub interval: u64,
}

/// Per-key statistics metadata, as returned by the cluster's key metadata
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatMetadata {
    pub key: String,
    /// Seconds the cluster caches the value before refreshing it. Absent for
    /// continuously updated stats.
    #[serde(default)]
    pub default_cache_time: Option<u64>,
    #[serde(default)]
    pub policies: Vec<CachePolicy>,
}

impl StatMetadata {
    /// The minimal useful poll cadence for this stat, scaled by
    /// `multiplier`.
    ///
    /// Policy intervals override the default cache time. A bare cache time
    /// gets one second added because a value refreshed at time T is not
    /// visible until T+1. Continuously updated stats poll at `multiplier`
    /// seconds.
    pub fn effective_cache_time(&self, multiplier: u64) -> u64 {
        if let Some(min_interval) = self.policies.iter().map(|p| p.interval).min() {
            return min_interval * multiplier;
        }
        match self.default_cache_time {
            Some(cache_time) => (cache_time + 1) * multiplier,
            None => multiplier,
        }
    }
}
