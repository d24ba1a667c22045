// Configuration module
//
// The relay consumes an already-parsed `Config` struct; `from_env` wires the
// same `config` crate sources the rest of the stack uses (environment
// variables plus an optional file named by CONFIG_FILE). Validation lives in
// `validate` and fails startup with a specific error.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Errors that make the relay refuse to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TLS is enabled but certFile/keyFile are not both set")]
    TlsWithoutCertOrKey,

    #[error("TLS certificate or key file is not readable: {0}")]
    TlsFileUnreadable(String),

    #[error("no environments configured")]
    NoEnvironments,

    #[error("environment {0:?} has no credentials")]
    EnvironmentWithoutCredentials(String),

    #[error("duplicate credential configured for environments {0:?} and {1:?}")]
    DuplicateCredential(String, String),

    #[error("multiple databases are enabled; only one of redis, consul, dynamodb is allowed")]
    MultipleDatabases,

    #[error("database kind {0:?} is not supported by this build")]
    UnsupportedDatabase(String),

    #[error("unparseable duration {0:?}")]
    BadDuration(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub main: MainConfig,
    pub events: EventsConfig,
    pub redis: Option<RedisConfig>,
    pub consul: Option<ConsulConfig>,
    pub dynamodb: Option<DynamoDbConfig>,
    /// Environment name -> per-environment settings.
    pub environments: HashMap<String, EnvConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            main: MainConfig::default(),
            events: EventsConfig::default(),
            redis: None,
            consul: None,
            dynamodb: None,
            environments: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct MainConfig {
    pub host: String,
    pub port: u16,
    /// Base URI of the upstream feature-management service (polling + goals).
    pub base_uri: String,
    /// URI of the upstream streaming service the SDK engine connects to.
    pub stream_uri: String,
    /// Interval between SSE heartbeat comments, e.g. "3m".
    pub heartbeat_interval: String,
    /// Optional maximum lifetime of one SSE connection, e.g. "5m".
    /// Empty means unlimited.
    pub max_client_connection_time: String,
    /// How long environment initialization may take before it is reported
    /// as failed, e.g. "10s".
    pub init_timeout: String,
    /// When true, any environment init failure terminates the process.
    pub exit_on_error: bool,
    pub tls_enabled: bool,
    pub tls_cert: String,
    pub tls_key: String,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8030,
            base_uri: "https://app.launchdarkly.com".to_string(),
            stream_uri: "https://stream.launchdarkly.com".to_string(),
            heartbeat_interval: "3m".to_string(),
            max_client_connection_time: String::new(),
            init_timeout: "10s".to_string(),
            exit_on_error: false,
            tls_enabled: false,
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct EventsConfig {
    /// Master switch for the analytics-event relay.
    pub send_events: bool,
    /// Upstream events host.
    pub events_uri: String,
    /// Flush cadence for buffered events, e.g. "5s".
    pub flush_interval: String,
    /// Bounded queue size per environment per inbox.
    pub capacity: usize,
    /// Sampling interval N: each inbound batch is admitted with
    /// probability 1/N. Zero or one means no sampling.
    pub sample_rate: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            send_events: true,
            events_uri: "https://events.launchdarkly.com".to_string(),
            flush_interval: "5s".to_string(),
            capacity: 1000,
            sample_rate: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisConfig {
    pub url: String,
    /// Local cache TTL in front of Redis: positive = expiring, "0" =
    /// no local cache, negative = cache forever (serves through outages).
    pub local_ttl: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            local_ttl: "30s".to_string(),
        }
    }
}

/// Recognized so that a config written for another relay build parses; this
/// build only ships the Redis adapter.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsulConfig {
    pub host: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct DynamoDbConfig {
    pub table_name: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvConfig {
    pub sdk_key: Option<String>,
    pub mobile_key: Option<String>,
    pub env_id: Option<String>,
    /// Key prefix inside the external KV store.
    pub prefix: Option<String>,
    /// CORS origin whitelist for client-side endpoints.
    pub allowed_origin: Vec<String>,
    /// Extra headers appended to the CORS Allow-Headers set.
    pub allowed_header: Vec<String>,
    pub secure_mode: bool,
    /// PHP-polling cache TTL, e.g. "30s". Empty disables Expires headers.
    pub ttl: String,
    /// Overrides the relay-wide `redis.localTtl` for this environment.
    pub local_ttl: Option<String>,
    /// Per-environment log level directive, folded into the tracing filter.
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the process environment plus an optional file
    /// named by CONFIG_FILE. Nested keys use `__` in environment variables
    /// (e.g. `MAIN__PORT=8030`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var("CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate everything that must be right before any environment is
    /// brought up. Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main.tls_enabled {
            if self.main.tls_cert.is_empty() || self.main.tls_key.is_empty() {
                return Err(ConfigError::TlsWithoutCertOrKey);
            }
            for path in [&self.main.tls_cert, &self.main.tls_key] {
                std::fs::metadata(path)
                    .map_err(|_| ConfigError::TlsFileUnreadable(path.clone()))?;
            }
        }

        if self.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }

        let databases = [
            self.redis.is_some(),
            self.consul.is_some(),
            self.dynamodb.is_some(),
        ];
        if databases.iter().filter(|enabled| **enabled).count() > 1 {
            return Err(ConfigError::MultipleDatabases);
        }
        if self.consul.is_some() {
            return Err(ConfigError::UnsupportedDatabase("consul".into()));
        }
        if self.dynamodb.is_some() {
            return Err(ConfigError::UnsupportedDatabase("dynamodb".into()));
        }

        // Every duration field must parse up front.
        parse_duration(&self.main.heartbeat_interval)?;
        parse_opt_duration(&self.main.max_client_connection_time)?;
        parse_duration(&self.main.init_timeout)?;
        parse_duration(&self.events.flush_interval)?;
        if let Some(redis) = &self.redis {
            parse_signed_duration(&redis.local_ttl)?;
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (name, env) in &self.environments {
            if env.sdk_key.is_none() && env.mobile_key.is_none() && env.env_id.is_none() {
                return Err(ConfigError::EnvironmentWithoutCredentials(name.clone()));
            }
            if !env.ttl.is_empty() {
                parse_duration(&env.ttl)?;
            }
            if let Some(local_ttl) = &env.local_ttl {
                parse_signed_duration(local_ttl)?;
            }
            for credential in [&env.sdk_key, &env.mobile_key, &env.env_id]
                .into_iter()
                .flatten()
            {
                if let Some(other) = seen.insert(credential.as_str(), name.as_str()) {
                    return Err(ConfigError::DuplicateCredential(
                        other.to_string(),
                        name.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.main.heartbeat_interval).unwrap_or(Duration::from_secs(180))
    }

    pub fn max_client_connection_time(&self) -> Option<Duration> {
        parse_opt_duration(&self.main.max_client_connection_time).unwrap_or(None)
    }

    pub fn init_timeout(&self) -> Duration {
        parse_duration(&self.main.init_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn flush_interval(&self) -> Duration {
        parse_duration(&self.events.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}

impl EnvConfig {
    pub fn php_ttl(&self) -> Option<Duration> {
        if self.ttl.is_empty() {
            None
        } else {
            parse_duration(&self.ttl).ok()
        }
    }
}

/// Local-cache TTL policy for the two-tier store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Entries expire after the duration.
    Expiring(Duration),
    /// No local cache; every read goes to the external store.
    Disabled,
    /// Entries never expire; the local tier serves through outages.
    Infinite,
}

impl RedisConfig {
    pub fn cache_ttl(&self) -> CacheTtl {
        ttl_from_text(&self.local_ttl)
    }

    /// The environment's override wins over the relay-wide setting.
    pub fn cache_ttl_for(&self, env: &EnvConfig) -> CacheTtl {
        match &env.local_ttl {
            Some(text) => ttl_from_text(text),
            None => self.cache_ttl(),
        }
    }
}

fn ttl_from_text(text: &str) -> CacheTtl {
    match parse_signed_duration(text) {
        Ok((duration, false)) if duration.is_zero() => CacheTtl::Disabled,
        Ok((duration, false)) => CacheTtl::Expiring(duration),
        Ok((_, true)) => CacheTtl::Infinite,
        Err(_) => CacheTtl::Expiring(Duration::from_secs(30)),
    }
}

/// Parse durations of the form "500ms", "30s", "5m", "1h". A bare number is
/// taken as seconds.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let text = text.trim();
    let bad = || ConfigError::BadDuration(text.to_string());

    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => text.split_at(split),
        None => (text, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| bad())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(bad()),
    }
}

/// Empty string means "not configured".
fn parse_opt_duration(text: &str) -> Result<Option<Duration>, ConfigError> {
    if text.trim().is_empty() {
        Ok(None)
    } else {
        parse_duration(text).map(Some)
    }
}

/// Like `parse_duration` but a leading `-` is allowed; returns
/// (magnitude, negative).
fn parse_signed_duration(text: &str) -> Result<(Duration, bool), ConfigError> {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix('-') {
        Ok((parse_duration(rest)?, true))
    } else {
        Ok((parse_duration(trimmed)?, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_env_config() -> Config {
        let mut config = Config::default();
        config.environments.insert(
            "production".to_string(),
            EnvConfig {
                sdk_key: Some("sdk-12345".to_string()),
                ..Default::default()
            },
        );
        config
    }

    #[test]
    fn valid_minimal_config() {
        assert!(one_env_config().validate().is_ok());
    }

    #[test]
    fn zero_environments_rejected() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::NoEnvironments)));
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let mut config = one_env_config();
        config.main.tls_enabled = true;
        config.main.tls_cert = "/tmp/cert.pem".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TlsWithoutCertOrKey)
        ));
    }

    #[test]
    fn multiple_databases_rejected() {
        let mut config = one_env_config();
        config.redis = Some(RedisConfig::default());
        config.consul = Some(ConsulConfig::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultipleDatabases)
        ));
    }

    #[test]
    fn duplicate_credentials_rejected() {
        let mut config = one_env_config();
        config.environments.insert(
            "staging".to_string(),
            EnvConfig {
                sdk_key: Some("sdk-12345".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateCredential(_, _))
        ));
    }

    #[test]
    fn bad_duration_rejected() {
        let mut config = one_env_config();
        config.main.heartbeat_interval = "three minutes".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::BadDuration(_))));
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("5 parsecs").is_err());
    }

    #[test]
    fn cache_ttl_sign_policy() {
        let mut redis = RedisConfig::default();
        assert_eq!(
            redis.cache_ttl(),
            CacheTtl::Expiring(Duration::from_secs(30))
        );
        redis.local_ttl = "0s".to_string();
        assert_eq!(redis.cache_ttl(), CacheTtl::Disabled);
        redis.local_ttl = "-1s".to_string();
        assert_eq!(redis.cache_ttl(), CacheTtl::Infinite);
    }

    #[test]
    fn per_environment_ttl_override() {
        let redis = RedisConfig::default();
        let mut env = EnvConfig::default();
        assert_eq!(
            redis.cache_ttl_for(&env),
            CacheTtl::Expiring(Duration::from_secs(30))
        );
        env.local_ttl = Some("-1s".to_string());
        assert_eq!(redis.cache_ttl_for(&env), CacheTtl::Infinite);
        env.local_ttl = Some("0s".to_string());
        assert_eq!(redis.cache_ttl_for(&env), CacheTtl::Disabled);
    }
}
