// ============================================
// Bounded event buffer with periodic upstream flush
// ============================================
//
// One buffer exists per environment per inbox kind. Producers enqueue
// without ever blocking: a full queue drops the event and the drop is
// reported once per flush cycle. The background task POSTs the whole queue
// as a single JSON array every flush tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};
use uuid::Uuid;

/// Schema version this relay forwards verbatim; see `X-LaunchDarkly-Event-Schema`.
pub const EVENT_SCHEMA_VERSION: u32 = 3;

pub const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
pub const PAYLOAD_ID_HEADER: &str = "X-LaunchDarkly-Payload-ID";
pub const PLATFORM_CATEGORY_HEADER: &str = "X-LaunchDarkly-Platform-Category";

/// Delay before the single retry of a failed flush.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Destination and credentials for one buffer's flushes.
#[derive(Clone)]
pub struct FlushTarget {
    /// Absolute upstream URI, e.g. `https://events.example.com/bulk`.
    pub uri: String,
    /// Authorization header value forwarded from the client, if any.
    pub authorization: Option<String>,
    /// Platform tag preserved for upstream analytics (mobile / browser).
    pub platform_category: Option<&'static str>,
}

#[derive(Clone)]
pub struct EventBufferHandle {
    tx: mpsc::Sender<Value>,
    dropped: Arc<AtomicU64>,
}

impl EventBufferHandle {
    /// Queue one event for the next flush. Returns immediately; a full
    /// buffer drops the event.
    pub fn enqueue(&self, event: Value) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::error!("event buffer channel closed unexpectedly");
                }
            }
        }
    }

    pub fn enqueue_all(&self, events: Vec<Value>) {
        for event in events {
            self.enqueue(event);
        }
    }
}

pub struct EventBuffer {
    rx: mpsc::Receiver<Value>,
    dropped: Arc<AtomicU64>,
    http: reqwest::Client,
    target: FlushTarget,
    flush_interval: Duration,
}

impl EventBuffer {
    /// Spawn the buffer's flush task. Returns the producer handle; dropping
    /// every handle shuts the task down after a final flush.
    pub fn spawn(
        http: reqwest::Client,
        target: FlushTarget,
        capacity: usize,
        flush_interval: Duration,
    ) -> EventBufferHandle {
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let buffer = EventBuffer {
            rx,
            dropped: dropped.clone(),
            http,
            target,
            flush_interval,
        };
        tokio::spawn(async move {
            buffer.run().await;
        });

        EventBufferHandle { tx, dropped }
    }

    async fn run(mut self) {
        let mut pending: Vec<Value> = Vec::new();
        let mut flush_timer = interval(self.flush_interval);
        flush_timer.tick().await;

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(e) => pending.push(e),
                        None => {
                            // All producers gone; flush what is left and exit.
                            self.flush(&mut pending).await;
                            return;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    self.flush(&mut pending).await;
                }
            }
        }
    }

    async fn flush(&self, pending: &mut Vec<Value>) {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(
                "event buffer for {} full; dropped {} events since last flush",
                self.target.uri,
                dropped
            );
        }

        if pending.is_empty() {
            return;
        }
        let batch: Vec<Value> = pending.drain(..).collect();
        let count = batch.len();

        // One payload ID per flush attempt; a retry reuses it so the
        // upstream can deduplicate.
        let payload_id = Uuid::new_v4().to_string();

        match self.post(&batch, &payload_id).await {
            PostOutcome::Delivered => {
                tracing::debug!("forwarded {} events to {}", count, self.target.uri);
            }
            PostOutcome::Rejected(status) => {
                tracing::warn!(
                    "upstream rejected {} events with {}; batch discarded",
                    count,
                    status
                );
            }
            PostOutcome::Retryable(reason) => {
                tracing::warn!("event flush failed ({}); retrying once", reason);
                tokio::time::sleep(RETRY_DELAY).await;
                match self.post(&batch, &payload_id).await {
                    PostOutcome::Delivered => {
                        tracing::debug!("forwarded {} events on retry", count);
                    }
                    outcome => {
                        tracing::warn!(
                            "event flush retry failed ({:?}); discarding {} events",
                            outcome,
                            count
                        );
                    }
                }
            }
        }
    }

    async fn post(&self, batch: &[Value], payload_id: &str) -> PostOutcome {
        let mut request = self
            .http
            .post(&self.target.uri)
            .header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION.to_string())
            .header(PAYLOAD_ID_HEADER, payload_id)
            .json(batch);
        if let Some(auth) = &self.target.authorization {
            request = request.header("Authorization", auth);
        }
        if let Some(category) = self.target.platform_category {
            request = request.header(PLATFORM_CATEGORY_HEADER, category);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    PostOutcome::Delivered
                } else if status.is_server_error() {
                    PostOutcome::Retryable(format!("status {}", status))
                } else {
                    PostOutcome::Rejected(status)
                }
            }
            Err(e) => PostOutcome::Retryable(e.to_string()),
        }
    }
}

#[derive(Debug)]
enum PostOutcome {
    Delivered,
    /// 4xx; the batch is discarded without retry to avoid duplication.
    Rejected(reqwest::StatusCode),
    /// 5xx or connection error; eligible for one same-ID retry.
    Retryable(String),
}
