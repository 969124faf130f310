use std::sync::Arc;

use futures::StreamExt;
use metering_core::MeterRecord;

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    store::RecordStore,
};

/// Upserts metered records into a [`RecordStore`] in batches.
pub struct StoreSink {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
}

impl StoreSink {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    async fn flush(&self, batch: &mut Vec<MeterRecord>) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store
            .upsert(batch)
            .await
            .map_err(|e| PipelineError::Sink(e.to_string()))?;
        metrics::counter!("store_upserted_records_total").increment(batch.len() as u64);
        batch.clear();
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink<MeterRecord> for StoreSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeterRecord>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.next().await {
            match item {
                Ok(env) => batch.push(env.payload),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping record that failed upstream");
                    continue;
                }
            }
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await?;
            }
        }

        self.flush(&mut batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_support::record, InMemoryRecordStore};
    use time::macros::datetime;

    #[tokio::test]
    async fn records_land_in_the_store() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = StoreSink::new(store.clone(), 2);

        let items: Vec<Result<Envelope<MeterRecord>, PipelineError>> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let at = datetime!(2024-02-01 00:00:00 UTC);
                Ok(Envelope::now(record("customer:1", id, at, "calls", "1")))
            })
            .collect();
        sink.run(futures::stream::iter(items)).await.unwrap();

        assert_eq!(store.len().await, 3);
    }
}
