use std::{marker::PhantomData, path::PathBuf};

use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Newline-delimited JSON file source, generic over the wire type
/// (`EventPayload` for backfills, `MeterRecord` for re-aggregation).
///
/// A line that fails to parse is yielded as an error and reading continues;
/// failing to open or read the file ends the stream.
pub struct NdjsonFileSource<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NdjsonFileSource<T> {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T> Source<T> for NdjsonFileSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn stream(&self) -> EnvelopeStream<T> {
        let path = self.path.clone();
        let s = async_stream::stream! {
            let file = match File::open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    let reason = format!("failed to open {}: {e}", path.display());
                    yield Err(PipelineError::Source(reason));
                    return;
                }
            };
            let mut lines = BufReader::new(file).lines();
            let mut line_no: u64 = 0;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        let reason = format!("failed to read {}: {e}", path.display());
                        yield Err(PipelineError::Source(reason));
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<T>(&line) {
                    Ok(payload) => yield Ok(Envelope::now(payload)),
                    Err(e) => {
                        metrics::counter!("ndjson_source_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!(
                            "{}:{line_no}: failed to parse json line: {e}",
                            path.display()
                        )));
                    }
                }
            }
        };

        Box::pin(s)
    }
}
