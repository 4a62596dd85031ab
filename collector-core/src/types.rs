//! Shared data types (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed 25-column insert shape every destination `Dynamic_*` table
/// shares (spec.md §6). Column order here is the order every `INSERT`
/// statement in this crate uses.
pub const DESTINATION_COLUMNS: [&str; 25] = [
    "ObjectId", "ID", "OBJID", "RECTIME", "T1", "T2", "T3", "T4", "T5", "T6", "T7", "T8", "V1",
    "V2", "V3", "V4", "V5", "P1", "P2", "P3", "P4", "H1", "H2", "H3", "H4",
];

/// A transient row flowing from some source to a destination table.
/// Numeric fields are nullable; `timestamp` is required for ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    pub object_id: String,
    pub id: String,
    pub objid: String,
    pub timestamp: DateTime<Utc>,
    pub t1: Option<f64>,
    pub t2: Option<f64>,
    pub t3: Option<f64>,
    pub t4: Option<f64>,
    pub t5: Option<f64>,
    pub t6: Option<f64>,
    pub t7: Option<f64>,
    pub t8: Option<f64>,
    pub v1: Option<f64>,
    pub v2: Option<f64>,
    pub v3: Option<f64>,
    pub v4: Option<f64>,
    pub v5: Option<f64>,
    pub p1: Option<f64>,
    pub p2: Option<f64>,
    pub p3: Option<f64>,
    pub p4: Option<f64>,
    pub h1: Option<f64>,
    pub h2: Option<f64>,
    pub h3: Option<f64>,
    pub h4: Option<f64>,
}

/// Key into the [`crate::pool::ConnectionPool`] registry (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub server: String,
    pub database: String,
    pub user: String,
}

impl PoolKey {
    pub fn new(server: impl Into<String>, database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            user: user.into(),
        }
    }
}

/// A single value out of a foreign database's dynamically-discovered result
/// set (spec.md §9 REDESIGN FLAG 4).
#[derive(Debug, Clone, PartialEq)]
pub enum ForeignValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl ForeignValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ForeignValue::Int(i) => Some(*i as f64),
            ForeignValue::Float(f) => Some(*f),
            ForeignValue::Text(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            ForeignValue::Text(s) => Some(s.clone()),
            ForeignValue::Int(i) => Some(i.to_string()),
            ForeignValue::Float(f) => Some(f.to_string()),
            ForeignValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            ForeignValue::Null => None,
        }
    }
}

/// One row from a foreign database, as an ordered list of (column name,
/// value) pairs rather than a statically-typed struct — the foreign
/// column set is discovered from result-set metadata, not hard-coded.
pub type ForeignRow = Vec<(String, ForeignValue)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_value_numeric_parsing_normalizes_decimal_separator() {
        let v = ForeignValue::Text("12,5".to_string());
        assert_eq!(v.as_f64(), Some(12.5));
    }

    #[test]
    fn foreign_value_unparseable_text_is_none() {
        let v = ForeignValue::Text("n/a".to_string());
        assert_eq!(v.as_f64(), None);
    }
}
