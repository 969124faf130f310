use std::{marker::PhantomData, path::PathBuf};

use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Writes one JSON document per line to a file, or to stdout when no path is
/// configured. An existing file is truncated.
pub struct NdjsonSink<T> {
    path: Option<PathBuf>,
    batch_size: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T> NdjsonSink<T> {
    pub fn new(path: Option<PathBuf>, batch_size: usize) -> Self {
        Self {
            path,
            batch_size: batch_size.max(1),
            _marker: PhantomData,
        }
    }

    async fn writer(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, PipelineError> {
        match &self.path {
            Some(path) => {
                let file = tokio::fs::File::create(path).await.map_err(|e| {
                    PipelineError::Sink(format!("failed to create {}: {e}", path.display()))
                })?;
                Ok(Box::new(file))
            }
            None => Ok(Box::new(tokio::io::stdout())),
        }
    }
}

async fn flush_lines<W>(out: &mut W, buffer: &mut String, lines: usize) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if buffer.is_empty() {
        return Ok(());
    }
    out.write_all(buffer.as_bytes())
        .await
        .map_err(|e| PipelineError::Sink(format!("ndjson write failed: {e}")))?;
    metrics::counter!("ndjson_sink_lines_total").increment(lines as u64);
    buffer.clear();
    Ok(())
}

#[async_trait::async_trait]
impl<T> Sink<T> for NdjsonSink<T>
where
    T: Serialize + Send + Sync + 'static,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<T>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut out = self.writer().await?;
        let mut buffer = String::new();
        let mut pending = 0usize;

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for NdjsonSink");
                    continue;
                }
            };

            let line = serde_json::to_string(&env.payload)
                .map_err(|e| PipelineError::Sink(format!("failed to serialize payload: {e}")))?;
            buffer.push_str(&line);
            buffer.push('\n');
            pending += 1;

            if pending >= self.batch_size {
                flush_lines(&mut out, &mut buffer, pending).await?;
                pending = 0;
            }
        }

        flush_lines(&mut out, &mut buffer, pending).await?;
        out.flush()
            .await
            .map_err(|e| PipelineError::Sink(format!("ndjson flush failed: {e}")))?;

        Ok(())
    }
}
