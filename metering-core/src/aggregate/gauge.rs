//! Time-weighted state reconstruction.
//!
//! A gauge sample holds its value from its own timestamp until the next
//! sample, as a step function. Steps are clamped to the aggregation window so
//! a value carried in from before the window only counts from `window.start`.

use std::collections::BTreeSet;

use super::Sample;
use crate::{
    config::GaugeAggregation,
    decimal::Decimal,
    domain::{MeterRecord, Unit},
    error::AggregationError,
    temporal::TimeWindow,
};

/// One step of the reconstructed state, already clamped to the window.
#[derive(Debug, Clone, Copy)]
struct Step<'a> {
    record: &'a MeterRecord,
    quantity: Decimal,
    valid: TimeWindow,
}

/// Apply a gauge aggregation to one unit's samples. `Ok(None)` on overflow.
///
/// Records whose state is visible inside the window are added to `contributors`.
pub(super) fn apply<'a>(
    kind: GaugeAggregation,
    samples: &mut [Sample<'a>],
    window: &TimeWindow,
    unit: &Unit,
    contributors: &mut BTreeSet<&'a str>,
) -> Result<Option<Decimal>, AggregationError> {
    let steps = steps(samples, window);
    let Some(last) = steps.last() else {
        return Err(AggregationError::NoStateInWindow(unit.to_string()));
    };
    contributors.extend(steps.iter().map(|s| s.record.id.as_str()));

    let value = match kind {
        GaugeAggregation::TimeWeightedAvg => time_weighted_avg(&steps, window),
        GaugeAggregation::PeakState => steps.iter().map(|s| s.quantity).max(),
        GaugeAggregation::MinState => steps.iter().map(|s| s.quantity).min(),
        GaugeAggregation::FinalState => Some(last.quantity),
    };
    Ok(value)
}

/// Sort samples and turn them into the non-empty steps inside `window`.
fn steps<'a>(samples: &mut [Sample<'a>], window: &TimeWindow) -> Vec<Step<'a>> {
    samples.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let mut steps = Vec::with_capacity(samples.len());
    for (i, sample) in samples.iter().enumerate() {
        let until = samples.get(i + 1).map_or(window.end(), |next| next.at());
        if let Some(valid) = window.clamp(sample.at(), until) {
            steps.push(Step {
                record: sample.record,
                quantity: sample.quantity,
                valid,
            });
        }
    }
    steps
}

/// Σ(quantity × time held) / length of the whole window. Time before the
/// first known state contributes zero.
///
/// Durations are counted in the coarsest tick that divides all of them, so a
/// month of day-aligned steps multiplies by at most 31. If the exact products
/// still overflow, each step's share of the window is taken first, which
/// trades the last digits of precision for range.
fn time_weighted_avg(steps: &[Step<'_>], window: &TimeWindow) -> Option<Decimal> {
    let total = window.duration().whole_nanoseconds();
    let held: Vec<i128> = steps.iter().map(|s| s.valid.duration().whole_nanoseconds()).collect();
    let tick = held.iter().fold(total, |g, &h| gcd(g, h));
    if tick == 0 {
        return None;
    }
    let total_ticks = Decimal::from_i128(total / tick)?;

    let exact = steps
        .iter()
        .zip(&held)
        .try_fold(Decimal::ZERO, |acc, (step, &h)| {
            acc.checked_add(step.quantity.checked_mul(Decimal::from_i128(h / tick)?)?)
        })
        .and_then(|weighted| weighted.checked_div(total_ticks));

    exact
        .or_else(|| {
            steps.iter().zip(&held).try_fold(Decimal::ZERO, |acc, (step, &h)| {
                let share = Decimal::from_i128(h / tick)?.checked_div(total_ticks)?;
                acc.checked_add(step.quantity.checked_mul(share)?)
            })
        })
        .map(Decimal::normalize)
}

fn gcd(a: i128, b: i128) -> i128 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::{
        aggregate::aggregate,
        config::Aggregation,
        decimal::Decimal,
        domain::MeterRecord,
        error::AggregationError,
    };
    use time::macros::datetime;

    /// 28-day window: 2024-02-01 .. 2024-02-29.
    fn feb(aggregation: Aggregation) -> crate::config::AggregateConfig {
        config(aggregation, datetime!(2024-02-01 00:00:00 UTC), datetime!(2024-02-29 00:00:00 UTC))
    }

    fn seats_10_then_15() -> (MeterRecord, Vec<MeterRecord>) {
        let prior = record("evt0", datetime!(2024-01-20 00:00:00 UTC), &[("seats", "10")]);
        let inside = vec![record("evt1", datetime!(2024-02-16 00:00:00 UTC), &[("seats", "15")])];
        (prior, inside)
    }

    fn value(
        aggregation: Aggregation,
        prior: Option<&MeterRecord>,
        records: &[MeterRecord],
    ) -> Decimal {
        aggregate(records, prior, &feb(aggregation)).unwrap().computed_values[0].quantity
    }

    #[test]
    fn time_weighted_avg_weights_by_duration() {
        let (prior, inside) = seats_10_then_15();
        let avg = value(Aggregation::TIME_WEIGHTED_AVG, Some(&prior), &inside);

        assert_eq!(avg.round_dp(10), Decimal::parse("12.3214285714").unwrap());
        assert_ne!(avg, Decimal::parse("12.5").unwrap());
    }

    #[test]
    fn carried_value_alone_is_returned_exactly() {
        let prior = record("evt0", datetime!(2024-01-20 00:00:00 UTC), &[("seats", "7.25")]);
        assert_eq!(
            value(Aggregation::TIME_WEIGHTED_AVG, Some(&prior), &[]),
            Decimal::parse("7.25").unwrap()
        );
        assert_eq!(
            value(Aggregation::FINAL_STATE, Some(&prior), &[]),
            Decimal::parse("7.25").unwrap()
        );
    }

    #[test]
    fn without_carry_forward_state_starts_at_first_sample() {
        // 15 held for the last 13 of 28 days, nothing known before.
        let (_, inside) = seats_10_then_15();
        let avg = value(Aggregation::TIME_WEIGHTED_AVG, None, &inside);
        assert_eq!(avg.round_dp(10), Decimal::parse("6.9642857143").unwrap());
        assert_eq!(value(Aggregation::MIN_STATE, None, &inside), Decimal::from(15i64));
    }

    #[test]
    fn peak_min_and_final_state() {
        let prior = record("evt0", datetime!(2024-01-20 00:00:00 UTC), &[("seats", "10")]);
        let inside = vec![
            record("evt2", datetime!(2024-02-20 00:00:00 UTC), &[("seats", "4")]),
            record("evt1", datetime!(2024-02-10 00:00:00 UTC), &[("seats", "30")]),
        ];
        assert_eq!(value(Aggregation::PEAK_STATE, Some(&prior), &inside), Decimal::from(30i64));
        assert_eq!(value(Aggregation::MIN_STATE, Some(&prior), &inside), Decimal::from(4i64));
        assert_eq!(value(Aggregation::FINAL_STATE, Some(&prior), &inside), Decimal::from(4i64));
    }

    #[test]
    fn superseded_carry_forward_does_not_count_towards_extremes() {
        // A sample exactly at window start replaces the carried value immediately.
        let prior = record("evt0", datetime!(2024-01-20 00:00:00 UTC), &[("seats", "99")]);
        let inside = vec![record("evt1", datetime!(2024-02-01 00:00:00 UTC), &[("seats", "5")])];
        assert_eq!(value(Aggregation::PEAK_STATE, Some(&prior), &inside), Decimal::from(5i64));
        assert_eq!(
            value(Aggregation::TIME_WEIGHTED_AVG, Some(&prior), &inside),
            Decimal::from(5i64)
        );

        let reading = aggregate(&inside, Some(&prior), &feb(Aggregation::PEAK_STATE)).unwrap();
        assert_eq!(reading.record_count, 1);
    }

    #[test]
    fn large_quantities_average_without_overflow() {
        let big = |s: &str| Decimal::parse(s).unwrap();

        let prior = record(
            "evt0",
            datetime!(2024-01-20 00:00:00 UTC),
            &[("bytes", "100000000000000000000000")],
        );
        assert_eq!(
            value(Aggregation::TIME_WEIGHTED_AVG, Some(&prior), &[]),
            big("100000000000000000000000")
        );

        let inside = vec![record(
            "evt1",
            datetime!(2024-02-15 00:00:00 UTC),
            &[("bytes", "300000000000000000000000")],
        )];
        assert_eq!(
            value(Aggregation::TIME_WEIGHTED_AVG, Some(&prior), &inside),
            big("200000000000000000000000")
        );
    }

    #[test]
    fn near_mantissa_limit_falls_back_to_per_step_shares() {
        let prior = record(
            "evt0",
            datetime!(2024-01-20 00:00:00 UTC),
            &[("bytes", "40000000000000000000000000000")],
        );
        let inside = vec![record(
            "evt1",
            datetime!(2024-02-15 00:00:00 UTC),
            &[("bytes", "60000000000000000000000000000")],
        )];
        assert_eq!(
            value(Aggregation::TIME_WEIGHTED_AVG, Some(&prior), &inside),
            Decimal::parse("50000000000000000000000000000").unwrap()
        );
    }

    #[test]
    fn samples_after_window_end_only_close_the_previous_step() {
        let prior = record("evt0", datetime!(2024-01-20 00:00:00 UTC), &[("seats", "10")]);
        let after = record("evt9", datetime!(2024-03-05 00:00:00 UTC), &[("seats", "1")]);
        let later = [after.clone()];
        assert_eq!(value(Aggregation::MIN_STATE, Some(&prior), &later), Decimal::from(10i64));
        assert_eq!(value(Aggregation::FINAL_STATE, Some(&prior), &later), Decimal::from(10i64));

        let reading = aggregate(&[after], Some(&prior), &feb(Aggregation::FINAL_STATE)).unwrap();
        assert_eq!(reading.record_count, 1);
    }

    #[test]
    fn unit_with_no_state_in_window_fails_whole_reading() {
        let after = record("evt9", datetime!(2024-03-05 00:00:00 UTC), &[("seats", "1")]);
        assert_eq!(
            aggregate(&[after], None, &feb(Aggregation::PEAK_STATE)),
            Err(AggregationError::NoStateInWindow("seats".to_string()))
        );
    }

    #[test]
    fn each_unit_is_reconstructed_independently() {
        let prior = record(
            "evt0",
            datetime!(2024-01-20 00:00:00 UTC),
            &[("seats", "10"), ("gb", "100")],
        );
        let inside = vec![record("evt1", datetime!(2024-02-15 00:00:00 UTC), &[("seats", "20")])];

        let reading =
            aggregate(&inside, Some(&prior), &feb(Aggregation::TIME_WEIGHTED_AVG)).unwrap();
        assert_eq!(reading.value("gb").unwrap().quantity, Decimal::from(100i64));
        assert_eq!(reading.value("seats").unwrap().quantity, Decimal::from(15i64));
        assert_eq!(reading.record_count, 2);
    }
}
