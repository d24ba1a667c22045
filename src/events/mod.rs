// Event ingestion pipeline
//
// Each environment gets one dispatcher owning up to three inboxes (server,
// mobile, browser), each a bounded buffer flushed to the matching upstream
// path. Payloads that carry the current schema header are relayed verbatim;
// older payloads go through the summarizer first. Diagnostic payloads skip
// the queue entirely and are forwarded as-is.

pub mod buffer;
pub mod summarize;

pub use buffer::{
    EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION, EventBufferHandle, PAYLOAD_ID_HEADER,
    PLATFORM_CATEGORY_HEADER,
};

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::config::EventsConfig;
use crate::store::FeatureStore;

use buffer::{EventBuffer, FlushTarget};

/// The three downstream origins whose events the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxKind {
    Server,
    Mobile,
    Browser,
}

impl InboxKind {
    fn platform_category(self) -> Option<&'static str> {
        match self {
            InboxKind::Server => None,
            InboxKind::Mobile => Some("mobile"),
            InboxKind::Browser => Some("browser"),
        }
    }

    fn bulk_path(self, env_id: Option<&str>) -> String {
        match self {
            InboxKind::Server => "/bulk".to_string(),
            InboxKind::Mobile => "/mobile".to_string(),
            InboxKind::Browser => format!("/events/bulk/{}", env_id.unwrap_or_default()),
        }
    }

    fn diagnostic_path(self, env_id: Option<&str>) -> String {
        match self {
            InboxKind::Server => "/diagnostic".to_string(),
            InboxKind::Mobile => "/mobile/events/diagnostic".to_string(),
            InboxKind::Browser => format!("/events/diagnostic/{}", env_id.unwrap_or_default()),
        }
    }
}

struct Inboxes {
    server: Option<EventBufferHandle>,
    mobile: Option<EventBufferHandle>,
    browser: Option<EventBufferHandle>,
}

pub struct EventDispatcher {
    http: reqwest::Client,
    events_uri: String,
    sample_rate: u32,
    env_id: Option<String>,
    sdk_key: Option<String>,
    mobile_key: Option<String>,
    /// Taken on close; dropping the handles lets each flush task drain and exit.
    inboxes: Mutex<Option<Inboxes>>,
}

impl EventDispatcher {
    pub fn new(
        http: reqwest::Client,
        config: &EventsConfig,
        flush_interval: Duration,
        sdk_key: Option<String>,
        mobile_key: Option<String>,
        env_id: Option<String>,
    ) -> Arc<Self> {
        let spawn = |kind: InboxKind, auth: Option<&String>| {
            EventBuffer::spawn(
                http.clone(),
                FlushTarget {
                    uri: format!("{}{}", config.events_uri, kind.bulk_path(env_id.as_deref())),
                    authorization: auth.cloned(),
                    platform_category: kind.platform_category(),
                },
                config.capacity,
                flush_interval,
            )
        };

        let inboxes = Inboxes {
            server: sdk_key.as_ref().map(|key| spawn(InboxKind::Server, Some(key))),
            mobile: mobile_key
                .as_ref()
                .map(|key| spawn(InboxKind::Mobile, Some(key))),
            browser: env_id.as_ref().map(|_| spawn(InboxKind::Browser, None)),
        };

        Arc::new(Self {
            http,
            events_uri: config.events_uri.clone(),
            sample_rate: config.sample_rate,
            env_id,
            sdk_key,
            mobile_key,
            inboxes: Mutex::new(Some(inboxes)),
        })
    }

    fn handle_for(&self, kind: InboxKind) -> Option<EventBufferHandle> {
        let inboxes = self.inboxes.lock().unwrap();
        let inboxes = inboxes.as_ref()?;
        match kind {
            InboxKind::Server => inboxes.server.clone(),
            InboxKind::Mobile => inboxes.mobile.clone(),
            InboxKind::Browser => inboxes.browser.clone(),
        }
    }

    /// Whether an inbound batch survives sampling. With interval N each
    /// batch is admitted with probability 1/N; an independent draw per batch.
    fn admit(&self) -> bool {
        if self.sample_rate <= 1 {
            return true;
        }
        rand::thread_rng().gen_range(0..self.sample_rate) == 0
    }

    /// Accept one inbound batch. `schema_version` is the parsed
    /// `X-LaunchDarkly-Event-Schema` header, if the client sent one.
    pub async fn accept(
        &self,
        kind: InboxKind,
        events: Vec<Value>,
        schema_version: Option<u32>,
        store: &dyn FeatureStore,
    ) {
        let Some(handle) = self.handle_for(kind) else {
            return;
        };
        if !self.admit() {
            tracing::debug!("event batch sampled out");
            return;
        }

        let forwarded = if schema_version.is_some_and(|v| v >= EVENT_SCHEMA_VERSION) {
            events
        } else {
            summarize::summarize(events, store).await
        };
        handle.enqueue_all(forwarded);
    }

    /// Diagnostic payloads are not buffered; forward immediately and
    /// swallow upstream failures (the client already got 202).
    pub async fn forward_diagnostic(&self, kind: InboxKind, payload: Value) {
        let uri = format!(
            "{}{}",
            self.events_uri,
            kind.diagnostic_path(self.env_id.as_deref())
        );
        let auth = match kind {
            InboxKind::Server => self.sdk_key.clone(),
            InboxKind::Mobile => self.mobile_key.clone(),
            InboxKind::Browser => None,
        };

        let mut request = self.http.post(&uri).json(&payload);
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        if let Some(category) = kind.platform_category() {
            request = request.header(PLATFORM_CATEGORY_HEADER, category);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    "upstream rejected diagnostic event with {}",
                    response.status()
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to forward diagnostic event: {}", e),
        }
    }

    /// Halt the flush timers. Idempotent.
    pub fn close(&self) {
        self.inboxes.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn dispatcher() -> Arc<EventDispatcher> {
        EventDispatcher::new(
            reqwest::Client::new(),
            &EventsConfig {
                events_uri: "http://127.0.0.1:9".to_string(),
                ..Default::default()
            },
            Duration::from_secs(3600),
            Some("sdk-key".to_string()),
            Some("mob-key".to_string()),
            Some("envid".to_string()),
        )
    }

    #[test]
    fn upstream_paths_per_inbox() {
        assert_eq!(InboxKind::Server.bulk_path(None), "/bulk");
        assert_eq!(InboxKind::Mobile.bulk_path(None), "/mobile");
        assert_eq!(
            InboxKind::Browser.bulk_path(Some("abc")),
            "/events/bulk/abc"
        );
        assert_eq!(
            InboxKind::Browser.diagnostic_path(Some("abc")),
            "/events/diagnostic/abc"
        );
    }

    #[test]
    fn platform_category_tags() {
        assert_eq!(InboxKind::Server.platform_category(), None);
        assert_eq!(InboxKind::Mobile.platform_category(), Some("mobile"));
        assert_eq!(InboxKind::Browser.platform_category(), Some("browser"));
    }

    #[tokio::test]
    async fn accept_after_close_is_a_noop() {
        let dispatcher = dispatcher();
        dispatcher.close();
        let store = MemoryStore::new(None);
        dispatcher
            .accept(
                InboxKind::Server,
                vec![json!({"kind": "identify"})],
                Some(EVENT_SCHEMA_VERSION),
                &store,
            )
            .await;
        // Double close stays idempotent.
        dispatcher.close();
    }

    #[tokio::test]
    async fn legacy_batches_are_summarized_before_enqueue() {
        let dispatcher = dispatcher();
        let store = MemoryStore::new(None);
        // Missing schema header routes through the summarizer; an empty
        // output (no feature events, nothing else) enqueues nothing.
        dispatcher
            .accept(InboxKind::Server, vec![], None, &store)
            .await;
    }

    #[tokio::test]
    async fn accepted_batch_reaches_the_upstream_verbatim() {
        use axum::extract::State as AxumState;
        use axum::http::HeaderMap;
        use tokio::sync::mpsc;

        // A one-route upstream standing in for the events host.
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(HeaderMap, Value)>();
        let upstream = axum::Router::new()
            .route(
                "/bulk",
                axum::routing::post(
                    |AxumState(tx): AxumState<mpsc::UnboundedSender<(HeaderMap, Value)>>,
                     headers: HeaderMap,
                     axum::Json(body): axum::Json<Value>| async move {
                        let _ = tx.send((headers, body));
                        axum::http::StatusCode::ACCEPTED
                    },
                ),
            )
            .with_state(seen_tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let dispatcher = EventDispatcher::new(
            reqwest::Client::new(),
            &EventsConfig {
                events_uri: format!("http://{}", addr),
                ..Default::default()
            },
            Duration::from_millis(50),
            Some("sdk-key".to_string()),
            None,
            None,
        );

        let store = MemoryStore::new(None);
        let batch = vec![json!({"kind": "identify", "key": "u"})];
        dispatcher
            .accept(
                InboxKind::Server,
                batch.clone(),
                Some(EVENT_SCHEMA_VERSION),
                &store,
            )
            .await;

        let (headers, body) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("flush deadline")
            .expect("upstream received a POST");
        assert_eq!(body, Value::Array(batch));
        assert_eq!(headers.get("authorization").unwrap(), "sdk-key");
        assert!(headers.get(PAYLOAD_ID_HEADER).is_some());
        assert_eq!(
            headers.get(EVENT_SCHEMA_HEADER).unwrap(),
            &EVENT_SCHEMA_VERSION.to_string()
        );
    }
}
