use std::sync::Arc;

use anyhow::Result;
use metering_core::{EventPayload, MeterRecord};
use metering_service::{
    config::{AppConfig, ConfigProvider},
    metrics_server, observability,
    pipeline::{Pipeline, Transform},
    sinks::RecordSink,
    sources::HttpJsonSource,
    transform::{EventValidation, MeterTransform},
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let events = &cfg.events;
    let metering = cfg.metering_config(&events.metering)?.clone();

    let sink = RecordSink::from_config(&cfg, &events.sink).await?;
    let source =
        HttpJsonSource::new(&events.source.http_bind_addr, events.source.channel_capacity).await?;

    tracing::info!(pipeline = %events.name, metering = %events.metering, "starting event pipeline");

    let checks: Vec<Arc<dyn Transform<EventPayload, EventPayload> + Send + Sync>> =
        vec![Arc::new(EventValidation)];
    let pipeline: Pipeline<_, EventPayload, MeterRecord, _> = Pipeline {
        source,
        checks,
        stage: Arc::new(MeterTransform::new(metering)),
        sink,
    };

    pipeline.run().await?;

    Ok(())
}
