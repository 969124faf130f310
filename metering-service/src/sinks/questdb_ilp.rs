use std::{
    marker::PhantomData,
    net::SocketAddr,
    time::{Duration, SystemTime},
};

use futures::StreamExt;
use metering_core::{MeterReading, Timestamp};
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Escape measurement/tag keys/tag values/field keys for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    ilp_escape_ident(key, out);
    out.push('=');
    ilp_escape_ident(value, out);
}

fn push_field_sep(out: &mut String, first: &mut bool, key: &str) {
    if *first {
        *first = false;
    } else {
        out.push(',');
    }
    ilp_escape_ident(key, out);
    out.push('=');
}

/// Quantities travel as strings so no precision is lost to f64.
fn push_field_str(out: &mut String, first: &mut bool, key: &str, value: &str) {
    push_field_sep(out, first, key);
    out.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}

fn push_field_int(out: &mut String, first: &mut bool, key: &str, value: u64) {
    push_field_sep(out, first, key);
    out.push_str(&value.to_string());
    out.push('i');
}

fn push_field_ts(out: &mut String, first: &mut bool, key: &str, value: Timestamp) {
    push_field_sep(out, first, key);
    out.push_str(&ts_to_unix_micros(value).to_string());
    out.push('t');
}

fn ts_to_unix_nanos(ts: Timestamp) -> i128 {
    ts.as_offset().unix_timestamp_nanos()
}

fn ts_to_unix_micros(ts: Timestamp) -> i128 {
    ts_to_unix_nanos(ts) / 1_000
}

pub trait IlpEncode {
    fn write_ilp_lines(&self, out: &mut String);
}

impl IlpEncode for MeterReading {
    /// One line per computed value, stamped with the window start.
    fn write_ilp_lines(&self, out: &mut String) {
        for value in &self.computed_values {
            out.push_str("meter_readings");

            // tags (SYMBOL columns)
            push_tag(out, "reading_id", &self.id);
            push_tag(out, "workspace_id", &self.workspace_id);
            push_tag(out, "universe_id", &self.universe_id);
            push_tag(out, "subject", self.subject.as_str());
            push_tag(out, "unit", value.unit.as_str());
            push_tag(out, "aggregation", value.aggregation.as_str());

            out.push(' ');
            let mut first = true;
            push_field_str(out, &mut first, "quantity", &value.quantity.to_string());
            push_field_int(out, &mut first, "record_count", self.record_count);
            push_field_ts(out, &mut first, "window_end", self.window.end());
            push_field_ts(out, &mut first, "max_metered_at", self.max_metered_at);
            push_field_ts(out, &mut first, "created_at", self.created_at);

            // timestamp (nanos)
            out.push(' ');
            out.push_str(&ts_to_unix_nanos(self.window.start()).to_string());
            out.push('\n');
        }
    }
}

pub struct QuestDbIlpSink<T> {
    addr: SocketAddr,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> QuestDbIlpSink<T> {
    pub fn new(
        addr: SocketAddr,
        batch_size: usize,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            addr,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
            _marker: PhantomData,
        }
    }

    async fn connect(&self) -> Result<TcpStream, PipelineError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| PipelineError::Sink(format!("failed to connect to QuestDB ILP: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl<T> QuestDbIlpSink<T>
where
    T: IlpEncode,
{
    fn encode_batch(batch: &[Envelope<T>]) -> Vec<u8> {
        let mut s = String::with_capacity(batch.len().saturating_mul(256));
        for env in batch {
            env.payload.write_ilp_lines(&mut s);
        }
        s.into_bytes()
    }

    async fn flush_batch(
        &self,
        stream: &mut TcpStream,
        batch: &[Envelope<T>],
    ) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let payload = Self::encode_batch(batch);

        let mut attempt: u32 = 0;
        loop {
            match stream.write_all(&payload).await {
                Ok(()) => {
                    metrics::counter!("questdb_ingested_readings_total")
                        .increment(batch.len() as u64);
                    metrics::counter!("questdb_ilp_bytes_total").increment(payload.len() as u64);

                    if let Some(min_received) = batch.iter().map(|e| e.received_at).min() {
                        if let Ok(dur) = SystemTime::now().duration_since(min_received) {
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
                        "QuestDB ILP flush failed, reconnecting and retrying"
                    );
                    metrics::counter!("questdb_ilp_retry_total").increment(1);

                    tokio::time::sleep(sleep_for).await;
                    *stream = self.connect().await?;
                }
                Err(e) => {
                    tracing::error!(error = %e, "QuestDB ILP flush failed, giving up");
                    metrics::counter!("questdb_ilp_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(format!("ilp write failed: {e}")));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T> Sink<T> for QuestDbIlpSink<T>
where
    T: IlpEncode + Send + Sync + 'static,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<T>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut stream = self.connect().await?;
        let mut buffer: Vec<Envelope<T>> = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for QuestDbIlpSink");
                    continue;
                }
            };

            buffer.push(env);
            if buffer.len() >= self.batch_size {
                self.flush_batch(&mut stream, &buffer).await?;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            self.flush_batch(&mut stream, &buffer).await?;
        }

        // Best-effort flush.
        let _ = stream.shutdown().await;

        Ok(())
    }
}

pub trait ShardKey {
    fn shard_key(&self) -> &str;
}

impl ShardKey for MeterReading {
    fn shard_key(&self) -> &str {
        self.subject.as_str()
    }
}

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Fans out to `workers` ILP connections; one subject always lands on the
/// same connection so its readings stay ordered.
pub struct QuestDbIlpParallelSink<T> {
    addr: SocketAddr,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    workers: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> QuestDbIlpParallelSink<T> {
    pub fn new(
        addr: SocketAddr,
        batch_size: usize,
        max_retries: u32,
        retry_backoff: Duration,
        workers: usize,
    ) -> Self {
        Self {
            addr,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
            workers: workers.max(1),
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T> Sink<T> for QuestDbIlpParallelSink<T>
where
    T: IlpEncode + ShardKey + Send + Sync + 'static,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<T>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let (tx, rx) =
                tokio::sync::mpsc::channel::<Envelope<T>>(self.batch_size.saturating_mul(2));
            txs.push(tx);

            let sink = QuestDbIlpSink::<T>::new(
                self.addr,
                self.batch_size,
                self.max_retries,
                self.retry_backoff,
            );
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok);

            joins.push(tokio::spawn(async move { sink.run(stream).await }));
        }

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "error in upstream pipeline for QuestDbIlpParallelSink"
                    );
                    continue;
                }
            };

            let idx = shard_index(env.payload.shard_key(), self.workers);
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink("ILP worker channel closed".to_string()));
            }
        }

        drop(txs);

        for j in joins {
            match j.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(PipelineError::Sink(format!("ILP worker join error: {e}"))),
            }
        }

        Ok(())
    }
}

pub type QuestDbIlpReadingSink = QuestDbIlpParallelSink<MeterReading>;
