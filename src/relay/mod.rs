// ============================================
// Relay core
// ============================================
//
// Owns every environment and the credential lookup maps. Lookups happen on
// every request and take only a read lock; add/remove take the write lock.
// No environment outlives the relay.

pub mod env;

pub use env::{Environment, InitOutcome, Readiness};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};

use crate::config::{Config, ConfigError, EnvConfig};
use crate::metrics::Metrics;
use crate::middleware::auth::Credential;
use crate::sdk::SdkClientFactory;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("environment {0:?} failed to initialize: {1}")]
    EnvironmentInit(String, String),

    #[error("timed out waiting for environments to initialize")]
    InitTimeout,
}

#[derive(Default)]
struct Lookup {
    by_sdk_key: HashMap<String, Arc<Environment>>,
    by_mobile_key: HashMap<String, Arc<Environment>>,
    by_env_id: HashMap<String, Arc<Environment>>,
    by_name: HashMap<String, Arc<Environment>>,
}

pub struct Relay {
    config: Config,
    factory: Arc<dyn SdkClientFactory>,
    http: reqwest::Client,
    metrics: Arc<Metrics>,
    lookup: RwLock<Lookup>,
    completion_tx: env::CompletionSender,
    completion_rx: Mutex<mpsc::UnboundedReceiver<InitOutcome>>,
    closed: AtomicBool,
}

impl Relay {
    /// Validate the configuration and bring up every configured
    /// environment. Environment initialization continues in the background;
    /// use `wait_for_all` to gate on it.
    pub async fn new(
        config: Config,
        factory: Arc<dyn SdkClientFactory>,
        http: reqwest::Client,
    ) -> Result<Arc<Self>, RelayError> {
        config.validate()?;

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            config: config.clone(),
            factory,
            http,
            metrics: Arc::new(Metrics::new()),
            lookup: RwLock::new(Lookup::default()),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            closed: AtomicBool::new(false),
        });

        for (name, env_config) in &config.environments {
            relay.add_environment(name.clone(), env_config.clone()).await?;
        }
        Ok(relay)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register and start one environment. Rejects credentials already
    /// owned by another environment.
    pub async fn add_environment(
        &self,
        name: String,
        env_config: EnvConfig,
    ) -> Result<Arc<Environment>, RelayError> {
        {
            let lookup = self.lookup.read().await;
            for credential in [
                &env_config.sdk_key,
                &env_config.mobile_key,
                &env_config.env_id,
            ]
            .into_iter()
            .flatten()
            {
                let owner = lookup
                    .by_sdk_key
                    .get(credential)
                    .or_else(|| lookup.by_mobile_key.get(credential))
                    .or_else(|| lookup.by_env_id.get(credential));
                if let Some(owner) = owner {
                    return Err(RelayError::Config(ConfigError::DuplicateCredential(
                        owner.name().to_string(),
                        name.clone(),
                    )));
                }
            }
        }

        let environment = Environment::start(
            name.clone(),
            env_config.clone(),
            &self.config,
            Arc::clone(&self.factory),
            self.http.clone(),
            self.completion_tx.clone(),
        )
        .await;

        let mut lookup = self.lookup.write().await;
        if let Some(sdk_key) = &env_config.sdk_key {
            lookup.by_sdk_key.insert(sdk_key.clone(), environment.clone());
        }
        if let Some(mobile_key) = &env_config.mobile_key {
            lookup
                .by_mobile_key
                .insert(mobile_key.clone(), environment.clone());
        }
        if let Some(env_id) = &env_config.env_id {
            lookup.by_env_id.insert(env_id.clone(), environment.clone());
        }
        lookup.by_name.insert(name.clone(), environment.clone());

        tracing::info!("added environment {:?}", name);
        Ok(environment)
    }

    /// O(1) lookup by credential kind.
    pub async fn get_environment(&self, credential: &Credential) -> Option<Arc<Environment>> {
        let lookup = self.lookup.read().await;
        match credential {
            Credential::SdkKey(key) => lookup.by_sdk_key.get(key).cloned(),
            Credential::MobileKey(key) => lookup.by_mobile_key.get(key).cloned(),
            Credential::EnvId(id) => lookup.by_env_id.get(id).cloned(),
        }
    }

    pub async fn environments(&self) -> Vec<Arc<Environment>> {
        let lookup = self.lookup.read().await;
        lookup.by_name.values().cloned().collect()
    }

    /// Atomically unregister all of an environment's credentials, then shut
    /// it down (closing any live SSE subscribers). Returns false when the
    /// SDK key is unknown.
    pub async fn remove_environment(&self, sdk_key: &str) -> bool {
        let removed = {
            let mut lookup = self.lookup.write().await;
            let Some(environment) = lookup.by_sdk_key.remove(sdk_key) else {
                return false;
            };
            if let Some(mobile_key) = &environment.config().mobile_key {
                lookup.by_mobile_key.remove(mobile_key);
            }
            if let Some(env_id) = &environment.config().env_id {
                lookup.by_env_id.remove(env_id);
            }
            lookup.by_name.remove(environment.name());
            environment
        };

        tracing::info!("removing environment {:?}", removed.name());
        removed.close().await;
        true
    }

    /// Block until every environment started so far has reported its init
    /// outcome. Success only if none reported an error within the timeout.
    pub async fn wait_for_all(&self, timeout: Duration) -> Result<(), RelayError> {
        let expected = self.lookup.read().await.by_name.len();
        let mut receiver = self.completion_rx.lock().await;

        let wait = async {
            let mut seen = 0usize;
            while seen < expected {
                match receiver.recv().await {
                    Some(outcome) => {
                        seen += 1;
                        if let Some(error) = outcome.error {
                            return Err(RelayError::EnvironmentInit(outcome.env_name, error));
                        }
                    }
                    None => return Err(RelayError::InitTimeout),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::InitTimeout),
        }
    }

    /// Overall health plus per-environment status, credentials obscured.
    pub async fn status(&self) -> serde_json::Value {
        let environments = self.environments().await;
        let mut entries = serde_json::Map::new();
        let mut healthy = true;
        for environment in &environments {
            let entry = environment.status().await;
            if entry["status"] != "connected" {
                healthy = false;
            }
            entries.insert(environment.name().to_string(), entry);
        }

        serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "clientVersion": env!("CARGO_PKG_VERSION"),
            "environments": entries,
        })
    }

    /// Shut down every environment. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let environments = {
            let mut lookup = self.lookup.write().await;
            lookup.by_sdk_key.clear();
            lookup.by_mobile_key.clear();
            lookup.by_env_id.clear();
            lookup.by_name.drain().map(|(_, env)| env).collect::<Vec<_>>()
        };
        for environment in environments {
            environment.close().await;
        }
        tracing::info!("relay closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::FixedDataClientFactory;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn config_with_env(name: &str, sdk_key: &str, env_id: Option<&str>) -> Config {
        let mut config = Config::default();
        config.environments.insert(
            name.to_string(),
            EnvConfig {
                sdk_key: Some(sdk_key.to_string()),
                env_id: env_id.map(str::to_string),
                ..Default::default()
            },
        );
        config
    }

    fn fixed_factory() -> Arc<dyn SdkClientFactory> {
        Arc::new(FixedDataClientFactory::new(
            StdHashMap::from([("f".to_string(), json!({"key": "f", "version": 1}))]),
            StdHashMap::new(),
        ))
    }

    const SDK_KEY: &str = "sdk-abcdefgh-ijkl-4mno-pqrs-tuvwxyz01234";

    #[tokio::test]
    async fn classify_then_lookup_finds_owner() {
        let config = config_with_env("production", SDK_KEY, Some("envid123"));
        let relay = Relay::new(config, fixed_factory(), reqwest::Client::new())
            .await
            .unwrap();
        relay.wait_for_all(Duration::from_secs(5)).await.unwrap();

        let by_key = relay
            .get_environment(&Credential::SdkKey(SDK_KEY.to_string()))
            .await
            .unwrap();
        assert_eq!(by_key.name(), "production");

        let by_id = relay
            .get_environment(&Credential::EnvId("envid123".to_string()))
            .await
            .unwrap();
        assert_eq!(by_id.name(), "production");

        // The same value under the wrong kind does not resolve.
        assert!(
            relay
                .get_environment(&Credential::MobileKey(SDK_KEY.to_string()))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn status_healthy_with_obscured_key() {
        let config = config_with_env("production", SDK_KEY, None);
        let relay = Relay::new(config, fixed_factory(), reqwest::Client::new())
            .await
            .unwrap();
        relay.wait_for_all(Duration::from_secs(5)).await.unwrap();

        let status = relay.status().await;
        assert_eq!(status["status"], "healthy");
        assert_eq!(status["environments"]["production"]["status"], "connected");
        let obscured = status["environments"]["production"]["sdkKey"]
            .as_str()
            .unwrap();
        assert!(obscured.starts_with("sdk-"));
        assert!(obscured.ends_with("z01234") || obscured.ends_with("01234"));
        assert!(!obscured.contains("abcdefgh"));
    }

    #[tokio::test]
    async fn failed_environment_degrades_status_but_relay_survives() {
        let config = config_with_env("production", SDK_KEY, None);
        let mut factory = FixedDataClientFactory::new(StdHashMap::new(), StdHashMap::new());
        factory.fail_with = Some("no upstream".to_string());
        let relay = Relay::new(config, Arc::new(factory), reqwest::Client::new())
            .await
            .unwrap();

        let result = relay.wait_for_all(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RelayError::EnvironmentInit(_, _))));
        assert_eq!(relay.status().await["status"], "degraded");
    }

    #[tokio::test]
    async fn remove_environment_closes_and_unregisters() {
        let config = config_with_env("production", SDK_KEY, Some("envid123"));
        let relay = Relay::new(config, fixed_factory(), reqwest::Client::new())
            .await
            .unwrap();
        relay.wait_for_all(Duration::from_secs(5)).await.unwrap();

        let environment = relay
            .get_environment(&Credential::SdkKey(SDK_KEY.to_string()))
            .await
            .unwrap();
        use crate::sse::PingRepository;
        use futures::StreamExt;
        let mut stream = environment.ping_publisher.subscribe(&PingRepository).await;
        stream.next().await.unwrap().unwrap();

        assert!(relay.remove_environment(SDK_KEY).await);
        // The subscriber's connection terminates promptly.
        assert!(stream.next().await.is_none());
        assert!(
            relay
                .get_environment(&Credential::SdkKey(SDK_KEY.to_string()))
                .await
                .is_none()
        );
        assert!(
            relay
                .get_environment(&Credential::EnvId("envid123".to_string()))
                .await
                .is_none()
        );
        // Unknown key: false, no panic.
        assert!(!relay.remove_environment(SDK_KEY).await);
    }

    #[tokio::test]
    async fn remove_then_re_add_restores_behavior() {
        let config = config_with_env("production", SDK_KEY, None);
        let env_config = config.environments["production"].clone();
        let relay = Relay::new(config, fixed_factory(), reqwest::Client::new())
            .await
            .unwrap();
        relay.wait_for_all(Duration::from_secs(5)).await.unwrap();

        assert!(relay.remove_environment(SDK_KEY).await);
        relay
            .add_environment("production".to_string(), env_config)
            .await
            .unwrap();
        relay.wait_for_all(Duration::from_secs(5)).await.unwrap();

        let environment = relay
            .get_environment(&Credential::SdkKey(SDK_KEY.to_string()))
            .await
            .unwrap();
        assert!(environment.initialized().await);
    }

    #[tokio::test]
    async fn duplicate_credential_rejected_on_add() {
        let config = config_with_env("production", SDK_KEY, None);
        let relay = Relay::new(config, fixed_factory(), reqwest::Client::new())
            .await
            .unwrap();

        let duplicate = EnvConfig {
            sdk_key: Some(SDK_KEY.to_string()),
            ..Default::default()
        };
        let result = relay.add_environment("staging".to_string(), duplicate).await;
        assert!(matches!(
            result,
            Err(RelayError::Config(ConfigError::DuplicateCredential(_, _)))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let config = config_with_env("production", SDK_KEY, None);
        let relay = Relay::new(config, fixed_factory(), reqwest::Client::new())
            .await
            .unwrap();
        relay.close().await;
        relay.close().await;
        assert!(relay.environments().await.is_empty());
    }
}
