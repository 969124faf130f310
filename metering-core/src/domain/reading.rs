use serde::{Deserialize, Serialize};

use super::ids::{Subject, Unit};
use crate::{
    config::Aggregation,
    decimal::Decimal,
    temporal::{TimeWindow, Timestamp},
};

/// Result of one aggregation over one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedValue {
    pub quantity: Decimal,
    pub unit: Unit,
    pub aggregation: Aggregation,
}

/// Aggregated usage of one subject over one window.
///
/// Recomputing from the same records yields the same `id` and values; only
/// `created_at` moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterReading {
    pub id: String,
    #[serde(rename = "workspaceID")]
    pub workspace_id: String,
    #[serde(rename = "universeID")]
    pub universe_id: String,
    pub subject: Subject,
    pub window: TimeWindow,
    /// Sorted by unit.
    #[serde(rename = "computedValues")]
    pub computed_values: Vec<ComputedValue>,
    pub aggregation: Aggregation,
    /// Distinct contributing records, not observations.
    #[serde(rename = "recordCount")]
    pub record_count: u64,
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
    /// Watermark: latest `metered_at` among contributing records.
    #[serde(rename = "maxMeteredAt")]
    pub max_metered_at: Timestamp,
}

impl MeterReading {
    pub fn value(&self, unit: &str) -> Option<&ComputedValue> {
        self.computed_values.iter().find(|v| v.unit.as_str() == unit)
    }
}
