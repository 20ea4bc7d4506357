//! Shared primitive identifiers and enums.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A materialized collection item.
pub type Item = Value;
/// Stable hash of a query descriptor, used as registry key.
pub type QueryHash = u64;
/// Monotonic per-query reconciliation version.
pub type Version = u64;

/// Stable identity of one collection item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    /// Integer identity.
    Int(i64),
    /// String identity.
    Str(String),
}

impl ItemKey {
    /// Reads a key out of a JSON scalar. Integral floats (`5.0`) key the same
    /// as integers, matching predicate equality; other non-integral numbers
    /// and non-scalar values have no identity.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| integral(n.as_f64()?)).map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// JSON literal used when matching this key inside a predicate.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(v) => Value::from(*v),
            Self::Str(s) => Value::String(s.clone()),
        }
    }
}

// 2^63 is exactly representable; anything at or past it overflows i64.
fn integral(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then_some(f as i64)
}

impl From<i64> for ItemKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ItemKey {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for ItemKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Synchronization policy applied to a query after mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Always reload the full query with its own options.
    #[default]
    Eager,
    /// Reload only the mutated keys and fold them into cached state.
    OnDemand,
}
