use metering_core::{aggregate, AggregateConfig, AggregationError, MeterReading};

use crate::store::{RecordStore, StoreError, SubjectKey};

/// Outcome of aggregating one window across every subject in a store.
#[derive(Debug, Default)]
pub struct AggregationReport {
    pub readings: Vec<MeterReading>,
    /// Subjects with nothing to aggregate in the window.
    pub skipped: usize,
    pub failed: Vec<(SubjectKey, AggregationError)>,
}

/// Compute one reading per subject for `config`'s window.
///
/// Store failures abort the batch. Aggregation failures for a single subject
/// are logged, counted and collected in the report.
pub async fn aggregate_window(
    store: &dyn RecordStore,
    config: &AggregateConfig,
) -> Result<AggregationReport, StoreError> {
    let window = config.window();
    let mut report = AggregationReport::default();

    for key in store.subjects().await? {
        let records = store.records_in_window(&key, &window).await?;
        let prior = store.last_before(&key, window.start()).await?;

        match aggregate(&records, prior.as_ref(), config) {
            Ok(reading) => {
                metrics::counter!("aggregation_readings_total").increment(1);
                report.readings.push(reading);
            }
            Err(AggregationError::NoData) => {
                tracing::debug!(subject = %key.subject, "no data in window");
                report.skipped += 1;
            }
            Err(e) => {
                metrics::counter!("aggregation_failures_total").increment(1);
                tracing::warn!(
                    subject = %key.subject,
                    workspace_id = %key.workspace_id,
                    error = %e,
                    "aggregation failed for subject"
                );
                report.failed.push((key, e));
            }
        }
    }

    tracing::info!(
        aggregation = %config.aggregation(),
        window = %window,
        readings = report.readings.len(),
        skipped = report.skipped,
        failed = report.failed.len(),
        "aggregated window"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_support::*, InMemoryRecordStore};
    use metering_core::{Aggregation, TimeWindow};
    use time::macros::datetime;

    fn feb(aggregation: Aggregation) -> AggregateConfig {
        let window = TimeWindow::new(
            ts(datetime!(2024-02-01 00:00:00 UTC)),
            ts(datetime!(2024-03-01 00:00:00 UTC)),
        )
        .unwrap();
        AggregateConfig::new(aggregation, window).unwrap()
    }

    #[tokio::test]
    async fn sums_each_subject_and_skips_subjects_without_window_data() {
        let store = InMemoryRecordStore::new();
        store
            .upsert(&[
                record("customer:1", "a", datetime!(2024-02-02 00:00:00 UTC), "calls", "1"),
                record("customer:1", "b", datetime!(2024-02-03 00:00:00 UTC), "calls", "2"),
                record("customer:2", "c", datetime!(2024-02-04 00:00:00 UTC), "calls", "5"),
                record("customer:3", "old", datetime!(2024-01-04 00:00:00 UTC), "calls", "7"),
            ])
            .await
            .unwrap();

        let report = aggregate_window(&store, &feb(Aggregation::SUM_EVENTS)).await.unwrap();

        assert_eq!(report.readings.len(), 2);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.readings[0].subject.as_str(), "customer:1");
        assert_eq!(report.readings[0].value("calls").unwrap().quantity.to_string(), "3");
        assert_eq!(report.readings[0].record_count, 2);
        assert_eq!(report.readings[1].value("calls").unwrap().quantity.to_string(), "5");
    }

    #[tokio::test]
    async fn gauges_carry_state_from_before_the_window() {
        let store = InMemoryRecordStore::new();
        store
            .upsert(&[
                record("customer:1", "jan", datetime!(2024-01-15 00:00:00 UTC), "seats", "4"),
                record("customer:1", "mid", datetime!(2024-02-15 00:00:00 UTC), "seats", "8"),
            ])
            .await
            .unwrap();

        let report = aggregate_window(&store, &feb(Aggregation::PEAK_STATE)).await.unwrap();
        assert_eq!(report.readings.len(), 1);
        assert_eq!(report.readings[0].value("seats").unwrap().quantity.to_string(), "8");

        let report = aggregate_window(&store, &feb(Aggregation::MIN_STATE)).await.unwrap();
        assert_eq!(report.readings[0].value("seats").unwrap().quantity.to_string(), "4");
        assert_eq!(report.readings[0].record_count, 2);
    }
}
