use super::Sample;
use crate::{config::CounterAggregation, decimal::Decimal};

/// Apply a counter aggregation to one unit's samples. `None` on overflow.
pub(super) fn apply(kind: CounterAggregation, samples: &[Sample<'_>]) -> Option<Decimal> {
    match kind {
        CounterAggregation::SumEvents => samples
            .iter()
            .try_fold(Decimal::ZERO, |acc, s| acc.checked_add(s.quantity)),
        CounterAggregation::MaxEvent => samples.iter().map(|s| s.quantity).max(),
        CounterAggregation::MinEvent => samples.iter().map(|s| s.quantity).min(),
        // Ties on observed_at resolve by metered_at, then record id, then the
        // later observation inside a record.
        CounterAggregation::LatestEvent => samples
            .iter()
            .max_by(|a, b| a.order_key().cmp(&b.order_key()))
            .map(|s| s.quantity),
    }
}
