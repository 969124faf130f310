pub mod ndjson;
pub mod questdb;
pub mod questdb_ilp;
pub mod store;

use std::{net::SocketAddr, time::Duration};

use metering_core::{MeterReading, MeterRecord};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::{
    config::{AppConfig, SinkConfig, SinkKind},
    pipeline::{Envelope, PipelineError, Sink},
    store::QuestDbRecordStore,
};

pub use ndjson::NdjsonSink;
pub use questdb::QuestDbRecordSink;
pub use questdb_ilp::{QuestDbIlpParallelSink, QuestDbIlpReadingSink, QuestDbIlpSink};
pub use store::StoreSink;

/// Where metered records go.
pub enum RecordSink {
    Ndjson(NdjsonSink<MeterRecord>),
    Pgwire(QuestDbRecordSink),
}

impl RecordSink {
    pub async fn from_config(cfg: &AppConfig, sink: &SinkConfig) -> anyhow::Result<Self> {
        match sink.kind {
            SinkKind::Ndjson => {
                Ok(Self::Ndjson(NdjsonSink::new(sink.path.clone(), sink.batch_size)))
            }
            SinkKind::Pgwire => {
                let pool = connect_pool(cfg).await?;
                QuestDbRecordStore::new(pool.clone()).ensure_schema().await?;
                Ok(Self::Pgwire(QuestDbRecordSink::new(
                    pool,
                    sink.batch_size,
                    sink.max_retries,
                    Duration::from_millis(sink.retry_backoff_ms),
                )))
            }
            SinkKind::Ilp => {
                anyhow::bail!("records cannot be written over ILP; use ndjson or pgwire")
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<MeterRecord> for RecordSink {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeterRecord>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        match self {
            Self::Ndjson(s) => s.run(input).await,
            Self::Pgwire(s) => s.run(input).await,
        }
    }
}

/// Where computed readings go.
pub enum ReadingSink {
    Ndjson(NdjsonSink<MeterReading>),
    Ilp(QuestDbIlpReadingSink),
}

impl ReadingSink {
    pub fn from_config(cfg: &AppConfig, sink: &SinkConfig) -> anyhow::Result<Self> {
        match sink.kind {
            SinkKind::Ndjson => {
                Ok(Self::Ndjson(NdjsonSink::new(sink.path.clone(), sink.batch_size)))
            }
            SinkKind::Ilp => {
                let ilp_addr: SocketAddr = cfg
                    .questdb()?
                    .ilp_tcp_addr
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid questdb.ilp_tcp_addr: {e}"))?;
                Ok(Self::Ilp(QuestDbIlpReadingSink::new(
                    ilp_addr,
                    sink.batch_size,
                    sink.max_retries,
                    Duration::from_millis(sink.retry_backoff_ms),
                    sink.workers,
                )))
            }
            SinkKind::Pgwire => {
                anyhow::bail!("readings are written over ILP or ndjson, not pgwire")
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<MeterReading> for ReadingSink {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeterReading>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        match self {
            Self::Ndjson(s) => s.run(input).await,
            Self::Ilp(s) => s.run(input).await,
        }
    }
}

pub async fn connect_pool(cfg: &AppConfig) -> anyhow::Result<PgPool> {
    let questdb = cfg.questdb()?;
    let pool = PgPoolOptions::new()
        .max_connections(questdb.max_connections)
        .connect(&questdb.uri)
        .await?;
    Ok(pool)
}

