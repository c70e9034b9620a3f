//! Data model for the consistency layer.

use serde::{Deserialize, Serialize};

/// A versioned record stored under a consistency key.
///
/// Values are JSON serializations of the caller's record types; the
/// consistency layer does not interpret them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datum {
    pub key: String,
    pub value: serde_json::Value,
    /// Monotonic per-store version, bumped on every write.
    pub timestamp: i64,
}

impl Datum {
    pub fn new(key: String, value: serde_json::Value, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
        }
    }
}
