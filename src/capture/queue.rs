//! Bounded, non-blocking event queue with a background batching shipper
//! (spec component C8, §4.4). Modeled on the actor-plus-mpsc pattern used
//! elsewhere in this codebase for background delivery: a single task owns
//! the transport and drains a channel on a timer, with an explicit message
//! for caller-triggered flush/shutdown instead of only reacting to time.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::ClientOptions;
use crate::endpoints::Endpoint;
use crate::error::{ApiErrorBody, Error};
use crate::transport::{Method, Transport};

enum QueueMessage {
    Capture(Value),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background shipper. Cheap to clone; all clones share the
/// same underlying channel and task.
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<QueueMessage>,
}

impl EventQueue {
    pub fn start(options: Arc<ClientOptions>, transport: Arc<dyn Transport>) -> Self {
        let (sender, receiver) = mpsc::channel(options.max_queue_size);
        let actor = BatcherActor {
            receiver,
            transport,
            endpoint: options.endpoints().build_url(Endpoint::Capture),
            api_key: options.api_key.clone(),
            flush_at: options.flush_at,
            flush_interval: options.flush_interval(),
            max_batch_size: options.max_batch_size,
            pending: Vec::new(),
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Non-blocking enqueue. Returns `false` (and drops the event) if the
    /// queue is full; never awaits transport latency.
    pub fn try_capture(&self, event: Value) -> bool {
        self.sender.try_send(QueueMessage::Capture(event)).is_ok()
    }

    /// Drains and ships everything enqueued so far, waiting for the batch
    /// dispatch to complete (or fail) before returning.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(QueueMessage::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(QueueMessage::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct BatcherActor {
    receiver: mpsc::Receiver<QueueMessage>,
    transport: Arc<dyn Transport>,
    endpoint: String,
    api_key: String,
    flush_at: usize,
    flush_interval: std::time::Duration,
    max_batch_size: usize,
    pending: Vec<Value>,
}

impl BatcherActor {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.flush_batch().await;
                }
                msg = self.receiver.recv() => {
                    match msg {
                        Some(QueueMessage::Capture(event)) => {
                            self.pending.push(event);
                            if self.pending.len() >= self.flush_at {
                                self.flush_batch().await;
                            }
                        }
                        Some(QueueMessage::Flush(ack)) => {
                            self.flush_batch().await;
                            let _ = ack.send(());
                        }
                        Some(QueueMessage::Shutdown(ack)) => {
                            self.flush_batch().await;
                            let _ = ack.send(());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn flush_batch(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        for chunk in batch.chunks(self.max_batch_size.max(1)) {
            if let Err(e) = self.send_chunk(chunk).await {
                warn!(error = %e, size = chunk.len(), "failed to ship event batch, dropping");
            }
        }
    }

    async fn send_chunk(&self, chunk: &[Value]) -> Result<(), Error> {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "historical_migrations": false,
            "batch": chunk,
        });

        let response = self.transport.request(Method::Post, &self.endpoint, &[], Some(&body)).await?;
        if response.is_success() {
            return Ok(());
        }

        let status = response.status;
        let error_body = response.json::<ApiErrorBody>().unwrap_or(ApiErrorBody {
            r#type: "unknown".into(),
            code: String::new(),
            detail: String::new(),
            attr: Value::Null,
        });
        Err(Error::Api(status, error_body))
    }
}
