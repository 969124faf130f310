use std::sync::Arc;

use metering_core::{meter, EventPayload, MeterRecord, MeteringConfig};
use time::macros::datetime;

use crate::pipeline::{Envelope, PipelineError, Transform};

/// Pure validation of an incoming event.
///
/// Rules:
/// - business time must lie within a broad sanity window [2000-01-01, 2100-01-01].
///
/// Field presence is already enforced when the payload is deserialized.
pub fn validate_event(
    env: Envelope<EventPayload>,
) -> Result<Envelope<EventPayload>, PipelineError> {
    let at = env.payload.time.as_offset();

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if at < min_ts || at > max_ts {
        return Err(PipelineError::Transform(format!(
            "event {}: timestamp out of allowed range",
            env.payload.id
        )));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct EventValidation;

#[async_trait::async_trait]
impl Transform<EventPayload, EventPayload> for EventValidation {
    async fn apply(
        &self,
        input: Envelope<EventPayload>,
    ) -> Result<Option<Envelope<EventPayload>>, PipelineError> {
        match validate_event(input) {
            Ok(env) => Ok(Some(env)),
            Err(e) => {
                metrics::counter!("validation_events_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

/// Runs the metering stage: one event in, at most one record out.
///
/// Events no extraction applies to are dropped quietly; extraction failures
/// surface as transform errors and the event yields nothing.
#[derive(Clone)]
pub struct MeterTransform {
    config: Arc<MeteringConfig>,
}

impl MeterTransform {
    pub fn new(config: MeteringConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait::async_trait]
impl Transform<EventPayload, MeterRecord> for MeterTransform {
    async fn apply(
        &self,
        input: Envelope<EventPayload>,
    ) -> Result<Option<Envelope<MeterRecord>>, PipelineError> {
        metrics::counter!("metering_events_total").increment(1);

        match meter(&input.payload, &self.config) {
            Ok(Some(record)) => {
                metrics::counter!("metering_records_total").increment(1);
                Ok(Some(input.map(record)))
            }
            Ok(None) => {
                metrics::counter!("metering_events_skipped_total").increment(1);
                Ok(None)
            }
            Err(e) => {
                metrics::counter!("metering_extraction_failures_total").increment(1);
                tracing::warn!(event_id = %input.payload.id, error = %e, "failed to meter event");
                Err(PipelineError::Transform(e.to_string()))
            }
        }
    }
}
