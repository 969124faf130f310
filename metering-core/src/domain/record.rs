use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::{require, Subject, Unit};
use crate::{
    decimal::Decimal,
    error::ValidationError,
    temporal::{TimeWindow, Timestamp},
};

/// What was observed: a quantity of some unit, at an instant or over a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub quantity: Decimal,
    pub unit: Unit,
    pub window: TimeWindow,
}

impl Observation {
    pub fn instant(quantity: Decimal, unit: Unit, at: Timestamp) -> Self {
        Self {
            quantity,
            unit,
            window: TimeWindow::instant(at),
        }
    }
}

/// Every observation extracted from one event, bundled so that they persist
/// (or fail) together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMeterRecord")]
pub struct MeterRecord {
    pub id: String,
    #[serde(rename = "workspaceID")]
    pub workspace_id: String,
    #[serde(rename = "universeID")]
    pub universe_id: String,
    pub subject: Subject,
    #[serde(rename = "observedAt")]
    pub observed_at: Timestamp,
    observations: Vec<Observation>,
    pub dimensions: BTreeMap<String, String>,
    #[serde(rename = "sourceEventID")]
    pub source_event_id: String,
    /// System processing time, distinct from the business time `observed_at`.
    #[serde(rename = "meteredAt")]
    pub metered_at: Timestamp,
}

#[derive(Deserialize)]
struct RawMeterRecord {
    id: String,
    #[serde(rename = "workspaceID")]
    workspace_id: String,
    #[serde(rename = "universeID")]
    universe_id: String,
    subject: Subject,
    #[serde(rename = "observedAt")]
    observed_at: Timestamp,
    observations: Vec<Observation>,
    #[serde(default)]
    dimensions: BTreeMap<String, String>,
    #[serde(rename = "sourceEventID")]
    source_event_id: String,
    #[serde(rename = "meteredAt")]
    metered_at: Timestamp,
}

impl TryFrom<RawMeterRecord> for MeterRecord {
    type Error = ValidationError;

    fn try_from(raw: RawMeterRecord) -> Result<Self, Self::Error> {
        MeterRecord::builder(raw.id, raw.workspace_id, raw.universe_id, raw.subject)
            .observed_at(raw.observed_at)
            .observations(raw.observations)
            .dimensions(raw.dimensions)
            .source_event_id(raw.source_event_id)
            .metered_at(raw.metered_at)
            .build()
    }
}

impl MeterRecord {
    pub fn builder(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        universe_id: impl Into<String>,
        subject: Subject,
    ) -> MeterRecordBuilder {
        MeterRecordBuilder {
            id: id.into(),
            workspace_id: workspace_id.into(),
            universe_id: universe_id.into(),
            subject,
            observed_at: None,
            observations: Vec::new(),
            dimensions: BTreeMap::new(),
            source_event_id: String::new(),
            metered_at: None,
        }
    }

    /// Never empty.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn units(&self) -> BTreeSet<&Unit> {
        self.observations.iter().map(|o| &o.unit).collect()
    }
}

pub struct MeterRecordBuilder {
    id: String,
    workspace_id: String,
    universe_id: String,
    subject: Subject,
    observed_at: Option<Timestamp>,
    observations: Vec<Observation>,
    dimensions: BTreeMap<String, String>,
    source_event_id: String,
    metered_at: Option<Timestamp>,
}

impl MeterRecordBuilder {
    pub fn observed_at(mut self, at: Timestamp) -> Self {
        self.observed_at = Some(at);
        self
    }

    pub fn observation(mut self, observation: Observation) -> Self {
        self.observations.push(observation);
        self
    }

    pub fn observations(mut self, observations: Vec<Observation>) -> Self {
        self.observations = observations;
        self
    }

    pub fn dimensions(mut self, dimensions: BTreeMap<String, String>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn source_event_id(mut self, id: impl Into<String>) -> Self {
        self.source_event_id = id.into();
        self
    }

    pub fn metered_at(mut self, at: Timestamp) -> Self {
        self.metered_at = Some(at);
        self
    }

    pub fn build(self) -> Result<MeterRecord, ValidationError> {
        if self.observations.is_empty() {
            return Err(ValidationError::NoObservations);
        }

        Ok(MeterRecord {
            id: require("id", self.id)?,
            workspace_id: require("workspaceID", self.workspace_id)?,
            universe_id: require("universeID", self.universe_id)?,
            subject: self.subject,
            observed_at: self.observed_at.ok_or(ValidationError::EmptyField("observedAt"))?,
            observations: self.observations,
            dimensions: self.dimensions,
            source_event_id: require("sourceEventID", self.source_event_id)?,
            metered_at: self.metered_at.ok_or(ValidationError::EmptyField("meteredAt"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIRE: &str = r#"{
        "id": "3f1c",
        "workspaceID": "ws-1",
        "universeID": "prod",
        "subject": "customer:42",
        "observedAt": "2024-01-01T12:00:00Z",
        "observations": [
            {
                "quantity": "1500",
                "unit": "tokens",
                "window": {"start": "2024-01-01T12:00:00Z", "end": "2024-01-01T12:00:00Z"}
            }
        ],
        "dimensions": {"model": "large"},
        "sourceEventID": "evt1",
        "meteredAt": "2024-01-01T12:00:05Z"
    }"#;

    #[test]
    fn wire_shape_parses_and_keeps_quantities_as_strings() {
        let record: MeterRecord = serde_json::from_str(WIRE).unwrap();
        assert_eq!(record.source_event_id, "evt1");
        assert_eq!(record.observations().len(), 1);
        assert!(record.observations()[0].window.is_instant());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["observations"][0]["quantity"], "1500");
        assert_eq!(json["sourceEventID"], "evt1");
        assert_eq!(json["meteredAt"], "2024-01-01T12:00:05Z");
    }

    #[test]
    fn records_without_observations_are_rejected() {
        let mut wire: serde_json::Value = serde_json::from_str(WIRE).unwrap();
        wire["observations"] = serde_json::json!([]);
        assert!(serde_json::from_value::<MeterRecord>(wire).is_err());
    }
}
