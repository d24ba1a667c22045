// ============================================
// Server-Sent Events publishers
// ============================================
//
// Each environment owns three publisher instances, one per channel kind:
// `all` (flags + segments), `flags` (legacy server-side), and `ping`
// (content-free notifications). A subscriber gets the channel repository's
// replay event first, then live events in publish order.
//
// Fan-out is non-blocking: publication try-sends into each subscriber's own
// channel, and a subscriber that cannot keep up is dropped rather than
// back-pressuring the publisher.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::response::sse::Event;
use futures::stream::Stream;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::store::{DataKind, FeatureStore};

/// Per-subscriber buffer. A subscriber this far behind is dropped.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    All,
    FlagsOnly,
    Ping,
}

impl ChannelKind {
    /// Path prefix used in patch/delete events on this channel.
    pub fn item_path(self, namespace: &str, key: &str) -> String {
        match self {
            ChannelKind::All => format!("/{}/{}", namespace, key),
            // The legacy flags channel addresses items at the root.
            ChannelKind::FlagsOnly | ChannelKind::Ping => format!("/{}", key),
        }
    }
}

/// Everything that can travel down one SSE connection. `Put` carries the
/// channel-shaped payload the repository built; the publisher does not
/// reinterpret it.
#[derive(Debug, Clone)]
pub enum SseMessage {
    Put { data: Value },
    Patch { path: String, data: Value },
    Delete { path: String, version: u64 },
    Ping,
    /// Heartbeat; rendered as an SSE comment line.
    Heartbeat,
}

impl SseMessage {
    fn into_event(self) -> Event {
        match self {
            SseMessage::Put { data } => Event::default().event("put").data(data.to_string()),
            SseMessage::Patch { path, data } => Event::default()
                .event("patch")
                .data(json!({ "path": path, "data": data }).to_string()),
            SseMessage::Delete { path, version } => Event::default()
                .event("delete")
                .data(json!({ "path": path, "version": version }).to_string()),
            SseMessage::Ping => Event::default().event("ping").data(""),
            SseMessage::Heartbeat => Event::default().comment(""),
        }
    }
}

/// Produces the initial-state event(s) for a fresh subscription. Data
/// channels replay a `put` snapshot taken at subscribe time; the ping
/// channel replays a single `ping`.
#[async_trait::async_trait]
pub trait SseRepository: Send + Sync {
    async fn replay(&self) -> Vec<SseMessage>;
}

/// A repository that always replays `ping`; used by all ping-driven routes.
pub struct PingRepository;

#[async_trait::async_trait]
impl SseRepository for PingRepository {
    async fn replay(&self) -> Vec<SseMessage> {
        vec![SseMessage::Ping]
    }
}

/// Replays `{"path": "/", "data": {"flags": ..., "segments": ...}}` from a
/// snapshot of the environment's store.
pub struct AllChannelRepository {
    pub store: Arc<dyn FeatureStore>,
}

#[async_trait::async_trait]
impl SseRepository for AllChannelRepository {
    async fn replay(&self) -> Vec<SseMessage> {
        let flags = self.store.all(DataKind::Flags).await.unwrap_or_default();
        let segments = self.store.all(DataKind::Segments).await.unwrap_or_default();
        vec![SseMessage::Put {
            data: json!({
                "path": "/",
                "data": { "flags": flags, "segments": segments }
            }),
        }]
    }
}

/// Replays the bare flags map for the legacy flags-only channel.
pub struct FlagsChannelRepository {
    pub store: Arc<dyn FeatureStore>,
}

#[async_trait::async_trait]
impl SseRepository for FlagsChannelRepository {
    async fn replay(&self) -> Vec<SseMessage> {
        let flags = self.store.all(DataKind::Flags).await.unwrap_or_default();
        vec![SseMessage::Put {
            data: json!(flags),
        }]
    }
}

struct Subscriber {
    tx: mpsc::Sender<SseMessage>,
}

struct PublisherInner {
    kind: ChannelKind,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    max_connection_time: Option<Duration>,
}

pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Create a publisher and start its heartbeat timer. The timer stops by
    /// itself once the publisher is dropped.
    pub fn new(
        kind: ChannelKind,
        heartbeat_interval: Duration,
        max_connection_time: Option<Duration>,
    ) -> Self {
        let inner = Arc::new(PublisherInner {
            kind,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max_connection_time,
        });

        let weak: Weak<PublisherInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(publisher) = weak.upgrade() else {
                    return;
                };
                publisher.fan_out(SseMessage::Heartbeat);
            }
        });

        Self { inner }
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    /// Open a subscription: replay the repository's snapshot, then live
    /// events. The returned stream ends on client disconnect, environment
    /// close, or max-connection-time expiry.
    pub async fn subscribe(&self, repository: &dyn SseRepository) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        // The snapshot goes into the channel before the subscriber is
        // registered, so no published event can precede it.
        for message in repository.replay().await {
            let _ = tx.try_send(message);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(id, Subscriber { tx });

        let deadline = self
            .inner
            .max_connection_time
            .map(|limit| Box::pin(tokio::time::sleep(limit)));

        EventStream {
            rx,
            deadline,
            _guard: SubscriptionGuard {
                id,
                publisher: Arc::downgrade(&self.inner),
            },
        }
    }

    /// Non-blocking fan-out to every current subscriber.
    pub fn publish(&self, message: SseMessage) {
        self.inner.fan_out(message);
    }

    /// Emit a heartbeat comment on all connections.
    pub fn publish_heartbeat(&self) {
        self.inner.fan_out(SseMessage::Heartbeat);
    }

    /// Terminate every subscription, e.g. on environment removal.
    pub fn close(&self) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        let dropped = subscribers.len();
        subscribers.clear();
        if dropped > 0 {
            tracing::debug!("closed {} SSE subscriptions", dropped);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

impl PublisherInner {
    fn fan_out(&self, message: SseMessage) {
        let mut subscribers = self.subscribers.lock().unwrap();
        // try_send keeps a slow subscriber from ever delaying the others;
        // when its buffer is full we drop the subscription instead.
        subscribers.retain(|_, subscriber| {
            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("dropping slow SSE subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

struct SubscriptionGuard {
    id: u64,
    publisher: Weak<PublisherInner>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.subscribers.lock().unwrap().remove(&self.id);
        }
    }
}

/// The response body stream of one SSE subscription.
pub struct EventStream {
    rx: mpsc::Receiver<SseMessage>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    _guard: SubscriptionGuard,
}

impl Stream for EventStream {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(deadline) = self.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                // Max connection time reached; end the stream so the client
                // reconnects, ideally landing on another relay instance.
                return Poll::Ready(None);
            }
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => Poll::Ready(Some(Ok(message.into_event()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
