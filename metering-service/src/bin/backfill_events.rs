use std::{env, path::Path, sync::Arc};

use anyhow::{bail, Result};
use metering_core::{EventPayload, MeterRecord};
use metering_service::{
    config::{AppConfig, ConfigProvider},
    observability,
    pipeline::{Pipeline, Source, Transform},
    sinks::RecordSink,
    sources::{EventCsvFileSource, NdjsonFileSource},
    transform::{EventValidation, MeterTransform},
};

/// Picks the reader from the file extension.
fn source_for(path: &Path) -> Result<Box<dyn Source<EventPayload>>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match ext {
        "ndjson" | "jsonl" => Ok(Box::new(NdjsonFileSource::<EventPayload>::new(path))),
        "csv" => Ok(Box::new(EventCsvFileSource::new(path))),
        "dat" => Ok(Box::new(EventCsvFileSource::new(path).with_delimiter(b'|'))),
        other => {
            bail!("unsupported event file extension '{other}' (expected ndjson, jsonl, csv or dat)")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_events <events.ndjson|events.csv|events.dat>");
    }
    let path = Path::new(&args[1]);

    // Point METERING_CONFIG at a backfill-specific file to change the sink.
    let cfg = AppConfig::load()?;
    let metering = cfg.metering_config(&cfg.events.metering)?.clone();

    let checks: Vec<Arc<dyn Transform<EventPayload, EventPayload> + Send + Sync>> =
        vec![Arc::new(EventValidation)];
    let pipeline: Pipeline<_, EventPayload, MeterRecord, _> = Pipeline {
        source: source_for(path)?,
        checks,
        stage: Arc::new(MeterTransform::new(metering)),
        sink: RecordSink::from_config(&cfg, &cfg.events.sink).await?,
    };

    tracing::info!(file = %path.display(), "backfilling events");
    pipeline.run().await?;

    Ok(())
}
