//! Aggregation engine: records over a window in, one reading out.
//!
//! The configured [`Aggregation`] decides both the algorithm and which inputs
//! it may see. Counters work on in-window records only; gauges reconstruct
//! state across the window start from the last record before it.

mod counter;
mod gauge;

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::{AggregateConfig, Aggregation},
    decimal::Decimal,
    domain::{ComputedValue, MeterReading, MeterRecord, Unit},
    error::AggregationError,
    identity,
    temporal::Timestamp,
};

/// One observation together with the record it came from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample<'a> {
    pub record: &'a MeterRecord,
    /// Index of the observation inside its record.
    pub position: usize,
    pub quantity: Decimal,
}

impl Sample<'_> {
    pub fn at(&self) -> Timestamp {
        self.record.observed_at
    }

    /// Total order used for "latest" and for state reconstruction.
    pub fn order_key(&self) -> (Timestamp, Timestamp, &str, usize) {
        (self.record.observed_at, self.record.metered_at, self.record.id.as_str(), self.position)
    }
}

/// Aggregate `records_in_window` (plus, for gauges, `last_before_window`) under
/// `config`, stamping `created_at` with the system clock.
pub fn aggregate(
    records_in_window: &[MeterRecord],
    last_before_window: Option<&MeterRecord>,
    config: &AggregateConfig,
) -> Result<MeterReading, AggregationError> {
    aggregate_at(records_in_window, last_before_window, config, Timestamp::now())
}

/// [`aggregate`] with an explicit computation time.
pub fn aggregate_at(
    records_in_window: &[MeterRecord],
    last_before_window: Option<&MeterRecord>,
    config: &AggregateConfig,
    created_at: Timestamp,
) -> Result<MeterReading, AggregationError> {
    if records_in_window.is_empty() && last_before_window.is_none() {
        return Err(AggregationError::NoData);
    }

    let in_window = dedup_by_id(records_in_window);
    let carried = last_before_window.filter(|prior| !in_window.iter().any(|r| r.id == prior.id));

    let participants: Vec<&MeterRecord> = match config.aggregation() {
        Aggregation::Counter(_) => in_window,
        Aggregation::Gauge(_) => carried.into_iter().chain(in_window).collect(),
    };
    let Some(first) = participants.first().copied() else {
        return Err(AggregationError::NoData);
    };
    ensure_same_subject(first, &participants)?;

    let mut groups: BTreeMap<&Unit, Vec<Sample<'_>>> = BTreeMap::new();
    for record in participants.iter().copied() {
        for (position, observation) in record.observations().iter().enumerate() {
            groups.entry(&observation.unit).or_default().push(Sample {
                record,
                position,
                quantity: observation.quantity,
            });
        }
    }

    let window = config.window();
    let mut computed_values = Vec::with_capacity(groups.len());
    let mut contributors: BTreeSet<&str> = BTreeSet::new();
    for (unit, mut samples) in groups {
        let quantity = match config.aggregation() {
            Aggregation::Counter(kind) => {
                contributors.extend(samples.iter().map(|s| s.record.id.as_str()));
                counter::apply(kind, &samples)
            }
            Aggregation::Gauge(kind) => {
                gauge::apply(kind, &mut samples, &window, unit, &mut contributors)?
            }
        }
        .ok_or_else(|| AggregationError::Arithmetic {
            unit: unit.to_string(),
            reason: "decimal overflow".to_string(),
        })?;

        computed_values.push(ComputedValue {
            quantity,
            unit: unit.clone(),
            aggregation: config.aggregation(),
        });
    }

    let max_metered_at = records_in_window
        .iter()
        .chain(last_before_window)
        .map(|r| r.metered_at)
        .max()
        .unwrap_or(first.metered_at);

    // Only records whose values reached the result; a superseded carry-forward does not.
    let record_count = contributors.len() as u64;

    let reading = MeterReading {
        id: identity::reading_id(
            first.subject.as_str(),
            computed_values.iter().map(|v| &v.unit),
            &window,
            config.aggregation(),
        ),
        workspace_id: first.workspace_id.clone(),
        universe_id: first.universe_id.clone(),
        subject: first.subject.clone(),
        window,
        computed_values,
        aggregation: config.aggregation(),
        record_count,
        created_at,
        max_metered_at,
    };

    tracing::debug!(
        reading_id = %reading.id,
        subject = %reading.subject,
        aggregation = %reading.aggregation,
        records = reading.record_count,
        units = reading.computed_values.len(),
        "computed meter reading"
    );

    Ok(reading)
}

/// Drop redelivered copies of the same record, keeping the most recently
/// metered one. Input order is otherwise preserved.
fn dedup_by_id(records: &[MeterRecord]) -> Vec<&MeterRecord> {
    let mut latest: BTreeMap<&str, &MeterRecord> = BTreeMap::new();
    for record in records {
        latest
            .entry(record.id.as_str())
            .and_modify(|kept| {
                if record.metered_at > kept.metered_at {
                    *kept = record;
                }
            })
            .or_insert(record);
    }

    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(latest.len());
    for record in records {
        if seen.insert(record.id.as_str()) {
            if let Some(kept) = latest.get(record.id.as_str()) {
                unique.push(*kept);
            }
        }
    }
    unique
}

fn ensure_same_subject(
    first: &MeterRecord,
    records: &[&MeterRecord],
) -> Result<(), AggregationError> {
    let key = |r: &MeterRecord| format!("{}/{}/{}", r.workspace_id, r.universe_id, r.subject);
    let expected = key(first);
    for record in records {
        let found = key(record);
        if found != expected {
            return Err(AggregationError::MixedSubjects { expected, found });
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};
    use time::macros::datetime;

    fn jan() -> (time::OffsetDateTime, time::OffsetDateTime) {
        (datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-02-01 00:00:00 UTC))
    }

    #[test]
    fn nothing_to_aggregate_is_an_error() {
        let (start, end) = jan();
        let cfg = config(Aggregation::SUM_EVENTS, start, end);
        assert_eq!(aggregate(&[], None, &cfg), Err(AggregationError::NoData));
    }

    #[test]
    fn counters_ignore_the_carried_forward_record() {
        let (start, end) = jan();
        let prior = record("evt0", datetime!(2023-12-31 00:00:00 UTC), &[("requests", "100")]);
        let cfg = config(Aggregation::SUM_EVENTS, start, end);
        assert_eq!(aggregate(&[], Some(&prior), &cfg), Err(AggregationError::NoData));

        let inside = record("evt1", datetime!(2024-01-05 00:00:00 UTC), &[("requests", "1")]);
        let reading = aggregate(&[inside], Some(&prior), &cfg).unwrap();
        assert_eq!(reading.computed_values[0].quantity, Decimal::ONE);
        assert_eq!(reading.record_count, 1);
    }

    #[test]
    fn groups_by_unit_across_records_and_sorts_values() {
        let (start, end) = jan();
        let records = vec![
            record(
                "evt1",
                datetime!(2024-01-02 00:00:00 UTC),
                &[("tokens", "10"), ("requests", "1")],
            ),
            record("evt2", datetime!(2024-01-03 00:00:00 UTC), &[("tokens", "5")]),
        ];
        let cfg = config(Aggregation::SUM_EVENTS, start, end);
        let reading = aggregate(&records, None, &cfg).unwrap();

        let units: Vec<&str> = reading.computed_values.iter().map(|v| v.unit.as_str()).collect();
        assert_eq!(units, ["requests", "tokens"]);
        assert_eq!(reading.value("tokens").unwrap().quantity, Decimal::from(15i64));
        assert_eq!(reading.value("requests").unwrap().quantity, Decimal::ONE);
        assert_eq!(reading.record_count, 2);
    }

    #[test]
    fn duplicate_records_are_counted_once() {
        let (start, end) = jan();
        let r = record("evt1", datetime!(2024-01-02 00:00:00 UTC), &[("requests", "1")]);
        let cfg = config(Aggregation::SUM_EVENTS, start, end);
        let reading = aggregate(&[r.clone(), r], None, &cfg).unwrap();
        assert_eq!(reading.computed_values[0].quantity, Decimal::ONE);
        assert_eq!(reading.record_count, 1);
    }

    #[test]
    fn watermark_is_max_metered_at_including_carry_forward() {
        let (start, end) = jan();
        let mut prior = record("evt0", datetime!(2023-12-31 00:00:00 UTC), &[("seats", "3")]);
        prior.metered_at = ts(datetime!(2024-01-20 00:00:00 UTC));
        let inside = record("evt1", datetime!(2024-01-10 00:00:00 UTC), &[("seats", "5")]);

        let cfg = config(Aggregation::PEAK_STATE, start, end);
        let reading = aggregate(&[inside], Some(&prior), &cfg).unwrap();
        assert_eq!(reading.max_metered_at, prior.metered_at);
        assert_eq!(reading.record_count, 2);
    }

    #[test]
    fn mixed_subjects_are_rejected() {
        let (start, end) = jan();
        let records = vec![
            record_for(
                "customer:1",
                "evt1",
                datetime!(2024-01-02 00:00:00 UTC),
                &[("requests", "1")],
            ),
            record_for(
                "customer:2",
                "evt2",
                datetime!(2024-01-03 00:00:00 UTC),
                &[("requests", "1")],
            ),
        ];
        assert!(matches!(
            aggregate(&records, None, &config(Aggregation::SUM_EVENTS, start, end)),
            Err(AggregationError::MixedSubjects { .. })
        ));
    }

    #[test]
    fn reading_id_is_stable_across_recomputation() {
        let (start, end) = jan();
        let cfg = config(Aggregation::SUM_EVENTS, start, end);
        let a = record("evt1", datetime!(2024-01-02 00:00:00 UTC), &[("requests", "1")]);
        let b = record("evt2", datetime!(2024-01-03 00:00:00 UTC), &[("requests", "2")]);

        let early = ts(datetime!(2024-02-01 00:05:00 UTC));
        let late = ts(datetime!(2024-02-01 01:00:00 UTC));
        let first = aggregate_at(&[a.clone(), b.clone()], None, &cfg, early).unwrap();
        let second = aggregate_at(&[b, a], None, &cfg, late).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.computed_values, second.computed_values);
        assert_ne!(first.created_at, second.created_at);
    }
}
