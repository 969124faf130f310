use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }

    /// Replace the payload, keeping the original receive time for latency metrics.
    pub fn map<U>(self, payload: U) -> Envelope<U> {
        Envelope {
            payload,
            received_at: self.received_at,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
impl<T, S> Source<T> for Box<S>
where
    S: Source<T> + ?Sized,
{
    async fn stream(&self) -> EnvelopeStream<T> {
        (**self).stream().await
    }
}

/// A pipeline step. `Ok(None)` drops the item without it being an error.
#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Option<Envelope<O>>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Source -> same-type checks -> one converting stage -> sink.
pub struct Pipeline<S, I, O, K> {
    pub source: S,
    pub checks: Vec<Arc<dyn Transform<I, I> + Send + Sync>>,
    pub stage: Arc<dyn Transform<I, O> + Send + Sync>,
    pub sink: K,
}

fn apply_transform<I, O>(
    stream: EnvelopeStream<I>,
    t: Arc<dyn Transform<I, O> + Send + Sync>,
) -> EnvelopeStream<O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    Box::pin(
        stream
            .then(move |item| {
                let t_inner = t.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            })
            .filter_map(|res| async move { res.transpose() }),
    )
}

impl<S, I, O, K> Pipeline<S, I, O, K>
where
    I: Send + 'static,
    O: Send + 'static,
    S: Source<I> + Send + Sync + 'static,
    K: Sink<O> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut stream = self.source.stream().await;

        for t in self.checks {
            stream = apply_transform(stream, t);
        }

        self.sink.run(apply_transform(stream, self.stage)).await
    }
}
