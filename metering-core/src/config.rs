//! Extraction and aggregation configuration.
//!
//! Both configs are supplied by an external provider; the types here only
//! guarantee that whatever reaches the engines is well formed.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{ids::require, Unit},
    error::{ConfigurationError, ValidationError},
    temporal::TimeWindow,
};

/// Discrete-event aggregations. They only ever see records inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CounterAggregation {
    SumEvents,
    MaxEvent,
    MinEvent,
    LatestEvent,
}

/// Persistent-state aggregations. State is reconstructed across the window
/// start from the last record before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GaugeAggregation {
    TimeWeightedAvg,
    PeakState,
    MinState,
    FinalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Aggregation {
    Counter(CounterAggregation),
    Gauge(GaugeAggregation),
}

impl Aggregation {
    pub const SUM_EVENTS: Aggregation = Aggregation::Counter(CounterAggregation::SumEvents);
    pub const MAX_EVENT: Aggregation = Aggregation::Counter(CounterAggregation::MaxEvent);
    pub const MIN_EVENT: Aggregation = Aggregation::Counter(CounterAggregation::MinEvent);
    pub const LATEST_EVENT: Aggregation = Aggregation::Counter(CounterAggregation::LatestEvent);
    pub const TIME_WEIGHTED_AVG: Aggregation =
        Aggregation::Gauge(GaugeAggregation::TimeWeightedAvg);
    pub const PEAK_STATE: Aggregation = Aggregation::Gauge(GaugeAggregation::PeakState);
    pub const MIN_STATE: Aggregation = Aggregation::Gauge(GaugeAggregation::MinState);
    pub const FINAL_STATE: Aggregation = Aggregation::Gauge(GaugeAggregation::FinalState);

    pub const ALL: [Aggregation; 8] = [
        Self::SUM_EVENTS,
        Self::MAX_EVENT,
        Self::MIN_EVENT,
        Self::LATEST_EVENT,
        Self::TIME_WEIGHTED_AVG,
        Self::PEAK_STATE,
        Self::MIN_STATE,
        Self::FINAL_STATE,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Counter(CounterAggregation::SumEvents) => "sum-events",
            Aggregation::Counter(CounterAggregation::MaxEvent) => "max-event",
            Aggregation::Counter(CounterAggregation::MinEvent) => "min-event",
            Aggregation::Counter(CounterAggregation::LatestEvent) => "latest-event",
            Aggregation::Gauge(GaugeAggregation::TimeWeightedAvg) => "time-weighted-avg",
            Aggregation::Gauge(GaugeAggregation::PeakState) => "peak-state",
            Aggregation::Gauge(GaugeAggregation::MinState) => "min-state",
            Aggregation::Gauge(GaugeAggregation::FinalState) => "final-state",
        }
    }
}

impl FromStr for Aggregation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aggregation::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownAggregation(s.to_string()))
    }
}

impl TryFrom<String> for Aggregation {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Aggregation> for String {
    fn from(value: Aggregation) -> String {
        value.as_str().to_string()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact-match `(property, value)` predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub property: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationExtraction {
    #[serde(rename = "sourceProperty", alias = "source")]
    pub source_property: String,
    pub unit: Unit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<PropertyFilter>,
}

impl ObservationExtraction {
    pub fn new(source_property: impl Into<String>, unit: Unit) -> Self {
        Self {
            source_property: source_property.into(),
            unit,
            filter: None,
        }
    }

    pub fn with_filter(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = Some(PropertyFilter {
            property: property.into(),
            value: value.into(),
        });
        self
    }
}

/// Ordered, non-empty list of extractions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMeteringConfig")]
pub struct MeteringConfig {
    extractions: Vec<ObservationExtraction>,
}

#[derive(Deserialize)]
struct RawMeteringConfig {
    extractions: Vec<ObservationExtraction>,
}

impl TryFrom<RawMeteringConfig> for MeteringConfig {
    type Error = ConfigurationError;

    fn try_from(raw: RawMeteringConfig) -> Result<Self, Self::Error> {
        MeteringConfig::new(raw.extractions)
    }
}

impl MeteringConfig {
    pub fn new(extractions: Vec<ObservationExtraction>) -> Result<Self, ConfigurationError> {
        if extractions.is_empty() {
            return Err(ConfigurationError::EmptyExtractions);
        }

        for (index, extraction) in extractions.iter().enumerate() {
            let invalid = |e: ValidationError| ConfigurationError::InvalidExtraction {
                index,
                reason: e.to_string(),
            };
            require("sourceProperty", extraction.source_property.clone()).map_err(invalid)?;
            if let Some(filter) = &extraction.filter {
                require("filter.property", filter.property.clone()).map_err(invalid)?;
            }
        }

        Ok(Self { extractions })
    }

    pub fn extractions(&self) -> &[ObservationExtraction] {
        &self.extractions
    }
}

/// Which aggregation to run over which window. The window is a proper span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAggregateConfig")]
pub struct AggregateConfig {
    aggregation: Aggregation,
    window: TimeWindow,
}

#[derive(Deserialize)]
struct RawAggregateConfig {
    aggregation: Aggregation,
    window: TimeWindow,
}

impl TryFrom<RawAggregateConfig> for AggregateConfig {
    type Error = ConfigurationError;

    fn try_from(raw: RawAggregateConfig) -> Result<Self, Self::Error> {
        AggregateConfig::new(raw.aggregation, raw.window)
    }
}

impl AggregateConfig {
    pub fn new(aggregation: Aggregation, window: TimeWindow) -> Result<Self, ConfigurationError> {
        if window.is_instant() {
            return Err(ConfigurationError::DegenerateWindow {
                start: window.start().to_rfc3339(),
                end: window.end().to_rfc3339(),
            });
        }
        Ok(Self { aggregation, window })
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Same aggregation over another window.
    pub fn with_window(&self, window: TimeWindow) -> Result<Self, ConfigurationError> {
        AggregateConfig::new(self.aggregation, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::Timestamp;
    use time::macros::datetime;

    #[test]
    fn aggregation_names_round_trip() {
        for a in Aggregation::ALL {
            assert_eq!(a.as_str().parse::<Aggregation>(), Ok(a));
            assert_eq!(serde_json::to_string(&a).unwrap(), format!("\"{}\"", a.as_str()));
        }
        assert_eq!(
            "average".parse::<Aggregation>(),
            Err(ValidationError::UnknownAggregation("average".to_string()))
        );
        assert!(serde_json::from_str::<Aggregation>("\"sum\"").is_err());
    }

    #[test]
    fn aggregation_class_is_structural() {
        assert!(matches!("sum-events".parse::<Aggregation>(), Ok(Aggregation::Counter(_))));
        assert!(matches!("final-state".parse::<Aggregation>(), Ok(Aggregation::Gauge(_))));
    }

    #[test]
    fn metering_config_requires_extractions() {
        assert_eq!(MeteringConfig::new(vec![]), Err(ConfigurationError::EmptyExtractions));
        assert!(serde_json::from_str::<MeteringConfig>(r#"{"extractions": []}"#).is_err());

        let cfg: MeteringConfig = serde_json::from_str(
            r#"{"extractions": [
                {"source": "tokens", "unit": "tokens"},
                {"sourceProperty": "bytes", "unit": "bytes",
                 "filter": {"property": "kind", "value": "upload"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(cfg.extractions().len(), 2);
        assert_eq!(cfg.extractions()[1].filter.as_ref().map(|f| f.value.as_str()), Some("upload"));
    }

    #[test]
    fn metering_config_rejects_blank_source_property() {
        let blank = ObservationExtraction::new(" ", Unit::new("tokens").unwrap());
        let res = MeteringConfig::new(vec![blank]);
        assert!(matches!(res, Err(ConfigurationError::InvalidExtraction { index: 0, .. })));
    }

    #[test]
    fn aggregate_config_rejects_instant_window() {
        let at = Timestamp::new(datetime!(2024-01-01 00:00:00 UTC)).unwrap();
        let res = AggregateConfig::new(Aggregation::TIME_WEIGHTED_AVG, TimeWindow::instant(at));
        assert!(matches!(res, Err(ConfigurationError::DegenerateWindow { .. })));
    }
}
