use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use metering_core::EventPayload;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<EventPayload>>,
}

/// Accepts `POST /ingest/events` with a JSON array of events.
///
/// Payloads are validated while deserializing; a malformed batch is rejected
/// as a whole before anything is queued.
#[derive(Clone)]
pub struct HttpJsonSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<EventPayload>>>>>,
}

pub fn router(tx: mpsc::Sender<Envelope<EventPayload>>) -> Router {
    Router::new()
        .route("/ingest/events", post(ingest_events))
        .with_state(SharedSender { tx })
}

impl HttpJsonSource {
    pub async fn new(bind_addr: &str, channel_capacity: usize) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let app = router(tx);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            PipelineError::Source(format!("failed to bind event listener on {addr}: {e}"))
        })?;
        tracing::info!(%addr, "event ingest endpoint listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "HTTP event source server error");
            }
        });

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

#[async_trait::async_trait]
impl Source<EventPayload> for HttpJsonSource {
    async fn stream(&self) -> EnvelopeStream<EventPayload> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "HttpJsonSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

async fn ingest_events(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<EventPayload>>,
) -> Result<StatusCode, StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);
    metrics::counter!("http_ingest_events_total").increment(payload.len() as u64);

    for event in payload {
        if sender.tx.send(Envelope::now(event)).await.is_err() {
            // Channel closed; treat as server error
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok(StatusCode::ACCEPTED)
}
