//! Extraction engine: one event in, at most one bundled record out.

use std::collections::BTreeSet;

use crate::{
    config::{MeteringConfig, ObservationExtraction},
    decimal::Decimal,
    domain::{EventPayload, MeterRecord, Observation},
    error::ExtractionError,
    identity,
    temporal::Timestamp,
};

/// Meter `event` against `config`, stamping `metered_at` with the system clock.
///
/// Returns `Ok(None)` when no extraction applies to the event. Any failure on
/// an applicable extraction fails the whole call; no partial record is built.
pub fn meter(
    event: &EventPayload,
    config: &MeteringConfig,
) -> Result<Option<MeterRecord>, ExtractionError> {
    meter_at(event, config, Timestamp::now())
}

/// [`meter`] with an explicit processing time.
pub fn meter_at(
    event: &EventPayload,
    config: &MeteringConfig,
    metered_at: Timestamp,
) -> Result<Option<MeterRecord>, ExtractionError> {
    let mut observations = Vec::with_capacity(config.extractions().len());

    for extraction in config.extractions() {
        if !filter_matches(event, extraction) {
            continue;
        }
        observations.push(extract(event, extraction)?);
    }

    if observations.is_empty() {
        tracing::trace!(event_id = %event.id, "no extraction applies to event");
        return Ok(None);
    }

    let consumed: BTreeSet<&str> = config
        .extractions()
        .iter()
        .map(|e| e.source_property.as_str())
        .collect();
    let dimensions = event
        .properties
        .iter()
        .filter(|(k, _)| !consumed.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let record = MeterRecord::builder(
        identity::record_id(&event.id),
        event.workspace_id.clone(),
        event.universe_id.clone(),
        event.subject.clone(),
    )
    .observed_at(event.time)
    .observations(observations)
    .dimensions(dimensions)
    .source_event_id(event.id.clone())
    .metered_at(metered_at)
    .build()
    .map_err(|source| ExtractionError::InvalidRecord {
        event_id: event.id.clone(),
        source,
    })?;

    tracing::debug!(
        event_id = %event.id,
        record_id = %record.id,
        observations = record.observations().len(),
        "metered event"
    );

    Ok(Some(record))
}

fn filter_matches(event: &EventPayload, extraction: &ObservationExtraction) -> bool {
    match &extraction.filter {
        Some(filter) => event.property(&filter.property) == Some(filter.value.as_str()),
        None => true,
    }
}

fn extract(
    event: &EventPayload,
    extraction: &ObservationExtraction,
) -> Result<Observation, ExtractionError> {
    let raw = event
        .property(&extraction.source_property)
        .ok_or_else(|| ExtractionError::MissingProperty {
            event_id: event.id.clone(),
            property: extraction.source_property.clone(),
        })?;

    let quantity = Decimal::parse(raw).map_err(|_| ExtractionError::InvalidQuantity {
        event_id: event.id.clone(),
        property: extraction.source_property.clone(),
        value: raw.to_string(),
    })?;

    Ok(Observation::instant(quantity, extraction.unit.clone(), event.time))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::{Subject, Unit};
    use time::macros::datetime;

    fn event(id: &str, props: &[(&str, &str)]) -> EventPayload {
        EventPayload::new(
            id,
            "ws-1",
            "prod",
            "llm.completion",
            Subject::new("customer:42").unwrap(),
            Timestamp::new(datetime!(2024-01-01 12:00:00 UTC)).unwrap(),
            props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
        )
        .unwrap()
    }

    fn extraction(source: &str, unit: &str) -> ObservationExtraction {
        ObservationExtraction::new(source, Unit::new(unit).unwrap())
    }

    fn at(dt: time::OffsetDateTime) -> Timestamp {
        Timestamp::new(dt).unwrap()
    }

    #[test]
    fn bundles_every_matching_extraction_into_one_record() {
        let cfg = MeteringConfig::new(vec![
            extraction("input_tokens", "input-tokens"),
            extraction("output_tokens", "output-tokens"),
        ])
        .unwrap();
        let evt = event(
            "evt1",
            &[("input_tokens", "100"), ("output_tokens", "250"), ("model", "large")],
        );

        let record = meter(&evt, &cfg).unwrap().unwrap();
        assert_eq!(record.observations().len(), 2);
        assert_eq!(record.observations()[0].unit.as_str(), "input-tokens");
        assert_eq!(record.observations()[1].quantity, Decimal::from(250i64));
        assert_eq!(record.source_event_id, "evt1");
        assert_eq!(record.id, identity::record_id("evt1"));
        assert_eq!(record.observed_at, evt.time);
        assert_eq!(record.dimensions.len(), 1);
        assert_eq!(record.dimensions.get("model").map(String::as_str), Some("large"));
    }

    #[test]
    fn failed_filter_skips_extraction() {
        let cfg = MeteringConfig::new(vec![
            extraction("bytes", "upload-bytes").with_filter("direction", "up"),
            extraction("bytes", "download-bytes").with_filter("direction", "down"),
        ])
        .unwrap();
        let evt = event("evt2", &[("bytes", "4096"), ("direction", "down")]);

        let record = meter(&evt, &cfg).unwrap().unwrap();
        assert_eq!(record.observations().len(), 1);
        assert_eq!(record.observations()[0].unit.as_str(), "download-bytes");
    }

    #[test]
    fn no_matching_filter_yields_no_record() {
        let upload = extraction("bytes", "upload-bytes").with_filter("direction", "up");
        let cfg = MeteringConfig::new(vec![upload]).unwrap();
        let evt = event("evt3", &[("direction", "sideways")]);
        assert_eq!(meter(&evt, &cfg), Ok(None));
    }

    #[test]
    fn missing_source_property_fails_the_whole_event() {
        let cfg = MeteringConfig::new(vec![
            extraction("tokens", "tokens"),
            extraction("images", "images"),
        ])
        .unwrap();
        let evt = event("evt4", &[("tokens", "10")]);

        assert_eq!(
            meter(&evt, &cfg),
            Err(ExtractionError::MissingProperty {
                event_id: "evt4".to_string(),
                property: "images".to_string(),
            })
        );
    }

    #[test]
    fn unparsable_quantity_fails_the_whole_event() {
        let cfg = MeteringConfig::new(vec![extraction("tokens", "tokens")]).unwrap();
        let evt = event("evt5", &[("tokens", "lots")]);
        assert!(matches!(meter(&evt, &cfg), Err(ExtractionError::InvalidQuantity { .. })));

        for raw in ["1_000", " 15 "] {
            let evt = event("evt5", &[("tokens", raw)]);
            assert!(matches!(
                meter(&evt, &cfg),
                Err(ExtractionError::InvalidQuantity { ref value, .. }) if value == raw
            ));
        }
    }

    #[test]
    fn replay_is_idempotent_apart_from_metered_at() {
        let cfg = MeteringConfig::new(vec![extraction("tokens", "tokens")]).unwrap();
        let evt = event("evt6", &[("tokens", "1500"), ("region", "eu")]);

        let first = meter_at(&evt, &cfg, at(datetime!(2024-01-01 12:00:01 UTC))).unwrap().unwrap();
        let second = meter_at(&evt, &cfg, at(datetime!(2024-01-01 13:00:00 UTC))).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.observations(), second.observations());
        assert_eq!(first.dimensions, second.dimensions);
        assert_ne!(first.metered_at, second.metered_at);
    }

    #[test]
    fn source_properties_of_skipped_extractions_are_not_dimensions() {
        let cfg = MeteringConfig::new(vec![
            extraction("tokens", "tokens"),
            extraction("cached", "cached-tokens").with_filter("cache", "hit"),
        ])
        .unwrap();
        let evt = event("evt7", &[("tokens", "5"), ("cached", "3"), ("cache", "miss")]);

        let record = meter(&evt, &cfg).unwrap().unwrap();
        assert_eq!(record.observations().len(), 1);
        assert!(!record.dimensions.contains_key("cached"));
        assert!(record.dimensions.contains_key("cache"));
    }
}
