use std::time::Duration;

use futures::StreamExt;
use metering_core::MeterRecord;
use sqlx::postgres::PgPool;

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    store::questdb::insert_records,
};

/// Writes meter records to QuestDB over pgwire, one row per observation.
pub struct QuestDbRecordSink {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbRecordSink {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn flush_batch(&self, batch: &[Envelope<MeterRecord>]) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match insert_records(&self.pool, batch.iter().map(|env| &env.payload)).await {
                Ok(rows) => {
                    metrics::counter!("questdb_ingested_records_total")
                        .increment(batch.len() as u64);
                    metrics::counter!("questdb_ingested_observations_total").increment(rows);

                    if let Some(min_received) = batch.iter().map(|e| e.received_at).min() {
                        if let Ok(dur) = std::time::SystemTime::now().duration_since(min_received) {
                            metrics::histogram!("ingest_end_to_end_latency_seconds")
                                .record(dur.as_secs_f64());
                        }
                    }

                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "questdb record sink flush failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "questdb record sink flush failed, giving up");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<MeterRecord> for QuestDbRecordSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeterRecord>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut buffer: Vec<Envelope<MeterRecord>> = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for QuestDbRecordSink");
                    continue;
                }
            };

            buffer.push(env);
            if buffer.len() >= self.batch_size {
                self.flush_batch(&buffer).await?;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            self.flush_batch(&buffer).await?;
        }

        Ok(())
    }
}
