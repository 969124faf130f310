use std::{env, sync::Arc};

use anyhow::{bail, Result};
use metering_core::{MeterRecord, TimeWindow, Timestamp};
use metering_service::{
    aggregator::aggregate_window,
    config::{AppConfig, ConfigProvider},
    observability,
    pipeline::{Envelope, PipelineError, Sink, Source},
    sinks::{connect_pool, ReadingSink, StoreSink},
    sources::NdjsonFileSource,
    store::{InMemoryRecordStore, QuestDbRecordStore, RecordStore},
};

const USAGE: &str =
    "usage: aggregate_window <records.ndjson|questdb> <aggregation-key> [<start> <end>]";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 && args.len() != 5 {
        bail!(USAGE);
    }
    let input = &args[1];
    let key = &args[2];

    let cfg = AppConfig::load()?;
    let mut agg = cfg.aggregate_config(key)?.clone();
    if args.len() == 5 {
        let window = TimeWindow::new(
            Timestamp::parse_rfc3339(&args[3])?,
            Timestamp::parse_rfc3339(&args[4])?,
        )?;
        agg = agg.with_window(window)?;
    }

    let store: Arc<dyn RecordStore> = if input == "questdb" {
        Arc::new(QuestDbRecordStore::new(connect_pool(&cfg).await?))
    } else {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let source = NdjsonFileSource::<MeterRecord>::new(input);
        StoreSink::new(store.clone(), 1_000).run(source.stream().await).await?;
        store
    };

    let report = aggregate_window(store.as_ref(), &agg).await?;
    if !report.failed.is_empty() {
        tracing::warn!(failed = report.failed.len(), "some subjects could not be aggregated");
    }

    let readings: Vec<Result<Envelope<_>, PipelineError>> =
        report.readings.into_iter().map(|r| Ok(Envelope::now(r))).collect();
    ReadingSink::from_config(&cfg, &cfg.readings.sink)?
        .run(futures::stream::iter(readings))
        .await?;

    Ok(())
}
