// Environment context
//
// One `Environment` binds a credential set to its SDK client, data store,
// SSE publishers, and event dispatcher. Initialization is asynchronous: the
// constructor returns immediately and the environment reports its outcome
// on the relay's completion channel once the SDK client is up (or has
// failed). Until then, endpoints for the environment answer 503.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};

use crate::config::{CacheTtl, Config, EnvConfig};
use crate::events::EventDispatcher;
use crate::sdk::{ClientContext, SdkClient, SdkClientFactory};
use crate::sse::{ChannelKind, Publisher, SseMessage};
use crate::store::{DataKind, FeatureStore, MemoryStore, RedisStore, StoreUpdate};
use crate::utils::obscure_key;

/// Sent to the relay when an environment finishes (or fails) initializing.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub env_name: String,
    pub error: Option<String>,
}

pub type CompletionSender = mpsc::UnboundedSender<InitOutcome>;

struct InitState {
    initialized: bool,
    last_error: Option<String>,
}

pub struct Environment {
    name: String,
    config: EnvConfig,
    store: Arc<dyn FeatureStore>,
    pub all_publisher: Publisher,
    pub flags_publisher: Publisher,
    pub ping_publisher: Publisher,
    dispatcher: Arc<EventDispatcher>,
    client: RwLock<Option<Arc<dyn SdkClient>>>,
    init: RwLock<InitState>,
    closed: AtomicBool,
}

impl Environment {
    /// Build the environment and kick off async initialization. The
    /// completion channel receives exactly one `InitOutcome` per call.
    pub async fn start(
        name: String,
        env_config: EnvConfig,
        relay_config: &Config,
        factory: Arc<dyn SdkClientFactory>,
        http: reqwest::Client,
        completion: CompletionSender,
    ) -> Arc<Self> {
        let heartbeat = relay_config.heartbeat_interval();
        let max_conn = relay_config.max_client_connection_time();

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        // Store adapter: Redis-backed when a database is configured,
        // in-memory otherwise. A Redis connection failure is an environment
        // init failure, not a relay failure; the memory fallback keeps the
        // endpoints answering 503 until a retry or removal.
        let mut store_error: Option<String> = None;
        let mut health_rx = None;
        let mut cache_ttl = CacheTtl::Disabled;
        let store: Arc<dyn FeatureStore> = match &relay_config.redis {
            Some(redis_config) => {
                let prefix = env_config
                    .prefix
                    .clone()
                    .unwrap_or_else(|| format!("flagrelay-{}", name));
                cache_ttl = redis_config.cache_ttl_for(&env_config);
                match RedisStore::connect(
                    &redis_config.url,
                    &prefix,
                    cache_ttl,
                    Some(updates_tx),
                )
                .await
                {
                    Ok(store) => {
                        health_rx = Some(store.health());
                        store
                    }
                    Err(e) => {
                        store_error = Some(format!("failed to open Redis store: {}", e));
                        Arc::new(MemoryStore::new(None))
                    }
                }
            }
            None => Arc::new(MemoryStore::new(Some(updates_tx))),
        };

        let dispatcher = EventDispatcher::new(
            http,
            &relay_config.events,
            relay_config.flush_interval(),
            env_config.sdk_key.clone(),
            env_config.mobile_key.clone(),
            env_config.env_id.clone(),
        );

        let environment = Arc::new(Self {
            name: name.clone(),
            config: env_config,
            store,
            all_publisher: Publisher::new(ChannelKind::All, heartbeat, max_conn),
            flags_publisher: Publisher::new(ChannelKind::FlagsOnly, heartbeat, max_conn),
            ping_publisher: Publisher::new(ChannelKind::Ping, heartbeat, max_conn),
            dispatcher,
            client: RwLock::new(None),
            init: RwLock::new(InitState {
                initialized: false,
                last_error: store_error.clone(),
            }),
            closed: AtomicBool::new(false),
        });

        environment.spawn_update_forwarder(updates_rx);

        if let Some(store_error) = store_error {
            tracing::error!("[env: {}] {}", name, store_error);
            let _ = completion.send(InitOutcome {
                env_name: name,
                error: Some(store_error),
            });
            return environment;
        }

        environment.spawn_init(
            factory,
            relay_config.main.base_uri.clone(),
            relay_config.main.stream_uri.clone(),
            relay_config.init_timeout(),
            completion,
        );
        if let Some(health_rx) = health_rx {
            environment.spawn_health_watcher(health_rx, cache_ttl);
        }
        environment
    }

    /// Consume applied store updates and fan them out: data channels get
    /// patch/delete with kind-appropriate paths, the ping channel gets a
    /// content-free ping for every change.
    fn spawn_update_forwarder(
        self: &Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<StoreUpdate>,
    ) {
        let environment = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let Some(env) = environment.upgrade() else {
                    return;
                };
                match update {
                    StoreUpdate::Init => {
                        // Full reload: replay fresh snapshots so streaming
                        // clients converge without reconnecting.
                        let flags = env.store.all(DataKind::Flags).await.unwrap_or_default();
                        let segments =
                            env.store.all(DataKind::Segments).await.unwrap_or_default();
                        env.all_publisher.publish(SseMessage::Put {
                            data: serde_json::json!({
                                "path": "/",
                                "data": { "flags": flags, "segments": segments }
                            }),
                        });
                        env.flags_publisher.publish(SseMessage::Put {
                            data: serde_json::json!(flags),
                        });
                        env.ping_publisher.publish(SseMessage::Ping);
                    }
                    StoreUpdate::Upsert { kind, key, item } => {
                        env.all_publisher.publish(SseMessage::Patch {
                            path: ChannelKind::All.item_path(kind.name(), &key),
                            data: item.clone(),
                        });
                        if kind == DataKind::Flags {
                            env.flags_publisher.publish(SseMessage::Patch {
                                path: ChannelKind::FlagsOnly.item_path(kind.name(), &key),
                                data: item,
                            });
                        }
                        env.ping_publisher.publish(SseMessage::Ping);
                    }
                    StoreUpdate::Delete { kind, key, version } => {
                        env.all_publisher.publish(SseMessage::Delete {
                            path: ChannelKind::All.item_path(kind.name(), &key),
                            version,
                        });
                        if kind == DataKind::Flags {
                            env.flags_publisher.publish(SseMessage::Delete {
                                path: ChannelKind::FlagsOnly.item_path(kind.name(), &key),
                                version,
                            });
                        }
                        env.ping_publisher.publish(SseMessage::Ping);
                    }
                }
            }
        });
    }

    fn spawn_init(
        self: &Arc<Self>,
        factory: Arc<dyn SdkClientFactory>,
        base_uri: String,
        stream_uri: String,
        init_timeout: Duration,
        completion: CompletionSender,
    ) {
        let environment = Arc::clone(self);
        tokio::spawn(async move {
            let context = ClientContext {
                env_name: environment.name.clone(),
                sdk_key: environment.config.sdk_key.clone().unwrap_or_default(),
                base_uri,
                stream_uri,
                store: environment.store.clone(),
                init_timeout,
            };

            let outcome = factory.create(context).await;
            let error = match outcome {
                Ok(client) => {
                    *environment.client.write().await = Some(client);
                    let mut init = environment.init.write().await;
                    init.initialized = true;
                    init.last_error = None;
                    tracing::info!("[env: {}] initialized", environment.name);
                    None
                }
                Err(e) => {
                    let message = e.to_string();
                    environment.init.write().await.last_error = Some(message.clone());
                    tracing::error!(
                        "[env: {}] initialization failed: {}",
                        environment.name,
                        message
                    );
                    Some(message)
                }
            };

            // Completion is reported regardless of the outcome so that
            // wait_for_all never hangs on a failed environment.
            let _ = completion.send(InitOutcome {
                env_name: environment.name.clone(),
                error,
            });
        });
    }

    /// Observe data-store health transitions. Under a finite cache TTL a
    /// recovery means locally-cached data may be stale, so the SDK engine
    /// is asked to re-sync the full dataset.
    fn spawn_health_watcher(
        self: &Arc<Self>,
        mut health: tokio::sync::watch::Receiver<bool>,
        cache_ttl: CacheTtl,
    ) {
        let environment = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut last = *health.borrow();
            while health.changed().await.is_ok() {
                let healthy = *health.borrow();
                let Some(env) = environment.upgrade() else {
                    return;
                };
                if healthy == last {
                    continue;
                }
                last = healthy;
                if healthy {
                    tracing::warn!("[env: {}] data store recovered", env.name);
                    if cache_ttl != CacheTtl::Infinite {
                        if let Some(client) = env.client.read().await.clone() {
                            client.resync().await;
                        }
                    }
                } else {
                    tracing::warn!("[env: {}] data store unavailable", env.name);
                }
            }
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Whether handlers may evaluate: the client is up, or the store has a
    /// usable dataset from a previous run to fall back on.
    pub async fn ready_for_evaluation(&self) -> Readiness {
        if self.initialized().await {
            return Readiness::Ready;
        }
        if self.store.initialized().await {
            return Readiness::StaleDataOnly;
        }
        Readiness::NotReady
    }

    pub async fn initialized(&self) -> bool {
        if !self.init.read().await.initialized {
            return false;
        }
        match self.client.read().await.as_ref() {
            Some(client) => client.initialized().await,
            None => false,
        }
    }

    pub async fn last_error(&self) -> Option<String> {
        self.init.read().await.last_error.clone()
    }

    /// Status-resource entry for this environment, credentials obscured.
    pub async fn status(&self) -> serde_json::Value {
        let connected = self.initialized().await;
        let mut entry = serde_json::Map::new();
        if let Some(sdk_key) = &self.config.sdk_key {
            entry.insert("sdkKey".to_string(), obscure_key(sdk_key).into());
        }
        if let Some(mobile_key) = &self.config.mobile_key {
            entry.insert("mobileKey".to_string(), obscure_key(mobile_key).into());
        }
        if let Some(env_id) = &self.config.env_id {
            // The environment ID is public; no obscuring.
            entry.insert("envId".to_string(), env_id.clone().into());
        }
        entry.insert(
            "status".to_string(),
            if connected { "connected" } else { "disconnected" }.into(),
        );
        serde_json::Value::Object(entry)
    }

    /// Tear the environment down in reverse construction order. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.dispatcher.close();
        self.all_publisher.close();
        self.flags_publisher.close();
        self.ping_publisher.close();
        if let Some(client) = self.client.write().await.take() {
            client.close().await;
        }
        self.store.close().await;
        tracing::info!("[env: {}] closed", self.name);
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::debug!("[env: {}] dropped without close()", self.name);
        }
    }
}

/// Evaluation readiness, see `Environment::ready_for_evaluation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The upstream connection is not up but the store holds data from a
    /// previous run; evaluation proceeds with a warning.
    StaleDataOnly,
    NotReady,
}
