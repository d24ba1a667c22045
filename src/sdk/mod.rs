// Upstream SDK engine contract.
//
// The relay only ever asks the engine four things: load the initial
// dataset, keep pushing updates into the data store, report whether it is
// initialized, and shut down. Everything else (stream protocol, backoff,
// targeting-rule semantics) belongs to the engine, not the relay. A thin
// polling implementation is included so the binary runs stand-alone; a
// full streaming engine can be dropped in through the same factory seam.

pub mod eval;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::{AllData, DataKind, FeatureStore, StoreItem};

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("timed out waiting for the SDK client to initialize")]
    InitTimeout,

    #[error("SDK client initialization failed: {0}")]
    Init(String),
}

/// Everything an engine implementation needs to come up for one environment.
#[derive(Clone)]
pub struct ClientContext {
    pub env_name: String,
    pub sdk_key: String,
    pub base_uri: String,
    pub stream_uri: String,
    pub store: Arc<dyn FeatureStore>,
    pub init_timeout: Duration,
}

/// A running upstream connection for one environment.
#[async_trait]
pub trait SdkClient: Send + Sync {
    /// True once the initial dataset made it into the store.
    async fn initialized(&self) -> bool;

    /// Ask the engine to re-fetch the full dataset, used after an external
    /// data store recovers from an outage.
    async fn resync(&self);

    /// Stop the upstream connection. Idempotent.
    async fn close(&self);
}

/// Builds an [`SdkClient`] per environment. The relay owns one factory for
/// all environments; swapping it out is how tests (and alternative engines)
/// plug in.
#[async_trait]
pub trait SdkClientFactory: Send + Sync {
    async fn create(&self, context: ClientContext) -> Result<Arc<dyn SdkClient>, SdkError>;
}

// ============================================
// Default polling engine
// ============================================

/// Wire shape of the upstream all-data resource.
fn parse_all_data(body: &Value) -> AllData {
    let mut data = AllData::default();
    for (kind, slot) in [
        (DataKind::Flags, &mut data.flags),
        (DataKind::Segments, &mut data.segments),
    ] {
        if let Some(items) = body.get(kind.name()).and_then(Value::as_object) {
            for (key, raw) in items {
                slot.insert(key.clone(), StoreItem::from_json(raw.clone()));
            }
        }
    }
    data
}

pub struct PollingClientFactory {
    http: reqwest::Client,
    poll_interval: Duration,
}

impl PollingClientFactory {
    pub fn new(http: reqwest::Client, poll_interval: Duration) -> Self {
        Self {
            http,
            poll_interval,
        }
    }
}

#[async_trait]
impl SdkClientFactory for PollingClientFactory {
    async fn create(&self, context: ClientContext) -> Result<Arc<dyn SdkClient>, SdkError> {
        let client = Arc::new(PollingClient {
            http: self.http.clone(),
            context,
            ready: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        // First load happens inline so init errors surface to the caller;
        // after that a background task keeps the store current.
        tokio::time::timeout(client.context.init_timeout, client.poll_once())
            .await
            .map_err(|_| SdkError::InitTimeout)?
            .map_err(SdkError::Init)?;
        client.ready.store(true, Ordering::SeqCst);

        let poller = Arc::clone(&client);
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the load that already happened
            loop {
                tick.tick().await;
                if poller.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = poller.poll_once().await {
                    tracing::warn!(
                        "[env: {}] upstream poll failed: {}",
                        poller.context.env_name,
                        e
                    );
                }
            }
        });

        Ok(client)
    }
}

struct PollingClient {
    http: reqwest::Client,
    context: ClientContext,
    ready: AtomicBool,
    stopped: AtomicBool,
}

impl PollingClient {
    async fn poll_once(&self) -> Result<(), String> {
        let url = format!("{}/sdk/latest-all", self.context.base_uri);
        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.context.sdk_key)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("upstream returned {}", status));
        }

        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        self.context
            .store
            .init(parse_all_data(&body))
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl SdkClient for PollingClient {
    async fn initialized(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn resync(&self) {
        if let Err(e) = self.poll_once().await {
            tracing::warn!(
                "[env: {}] resync after store recovery failed: {}",
                self.context.env_name,
                e
            );
        }
    }

    async fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================
// In-process engine for tests
// ============================================

/// Loads a fixed dataset into the store and reports initialized. Used by
/// unit tests and by integration setups that have no upstream.
pub struct FixedDataClientFactory {
    pub flags: HashMap<String, Value>,
    pub segments: HashMap<String, Value>,
    /// When set, `create` fails with this message instead.
    pub fail_with: Option<String>,
}

impl FixedDataClientFactory {
    pub fn new(flags: HashMap<String, Value>, segments: HashMap<String, Value>) -> Self {
        Self {
            flags,
            segments,
            fail_with: None,
        }
    }
}

#[async_trait]
impl SdkClientFactory for FixedDataClientFactory {
    async fn create(&self, context: ClientContext) -> Result<Arc<dyn SdkClient>, SdkError> {
        if let Some(message) = &self.fail_with {
            return Err(SdkError::Init(message.clone()));
        }

        let mut data = AllData::default();
        for (key, raw) in &self.flags {
            data.flags
                .insert(key.clone(), StoreItem::from_json(raw.clone()));
        }
        for (key, raw) in &self.segments {
            data.segments
                .insert(key.clone(), StoreItem::from_json(raw.clone()));
        }
        context
            .store
            .init(data)
            .await
            .map_err(|e| SdkError::Init(e.to_string()))?;

        Ok(Arc::new(FixedDataClient {
            closed: AtomicBool::new(false),
        }))
    }
}

struct FixedDataClient {
    closed: AtomicBool,
}

#[async_trait]
impl SdkClient for FixedDataClient {
    async fn initialized(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn resync(&self) {}

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
