//! Configuration handling for the RPC session pool.
//!
//! Settings come from a [`SettingsProvider`] and are resolved into one
//! [`PoolConfig`] per pool. The `rpc-pool` binary reads its own options from CLI
//! arguments and environment variables.

use crate::client::ContextData;
use crate::error::{PoolError, PoolResult};
use clap::Parser;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_POOL_NAME: &str = "default";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Broker address key inside a broker config.
pub const BROKER_URI_KEY: &str = "AMQP_URI";

// Pool keys extracted from a named entry before it reaches the RPC client
pub const POOL_SIZE_KEY: &str = "POOL_SIZE";
pub const POOL_CONTEXT_DATA_KEY: &str = "POOL_CONTEXT_DATA";
pub const POOL_TIMEOUT_KEY: &str = "POOL_TIMEOUT";

/// Broker configuration handed to the RPC client factory as-is.
pub type BrokerConfig = Map<String, Value>;

/// Process settings as supplied by a configuration provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Flat broker config (single pool) or a mapping of lower-case pool names to
    /// broker configs (multi pool).
    #[serde(rename = "RPC_CONFIG", default, skip_serializing_if = "Option::is_none")]
    pub rpc_config: Option<Map<String, Value>>,
    /// Pool size used when an entry does not set one (default: 4)
    #[serde(rename = "RPC_POOL_SIZE", default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    /// Context data used when an entry does not set one
    #[serde(rename = "RPC_CONTEXT_DATA", default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<ContextData>,
    /// RPC timeout in seconds; zero or negative means no timeout
    #[serde(rename = "RPC_TIMEOUT", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl Settings {
    /// Create settings around a single flat broker config.
    pub fn single(broker: Value) -> Self {
        Self {
            rpc_config: broker.as_object().cloned(),
            ..Self::default()
        }
    }

    /// Parse settings from a JSON document.
    pub fn from_json_str(json: &str) -> PoolResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PoolError::configuration(format!("Invalid settings JSON: {e}")))
    }

    /// Get pool_size with default value.
    pub fn pool_size_or_default(&self) -> usize {
        self.pool_size.unwrap_or(DEFAULT_POOL_SIZE)
    }

    /// Get the timeout, treating zero or negative values as unset.
    pub fn timeout_or_default(&self) -> Option<Duration> {
        self.timeout_secs.and_then(positive_duration)
    }

    /// Resolve these settings into the pools the registry should build.
    pub fn resolve(&self) -> PoolResult<PoolPlan> {
        let rpc_config = self
            .rpc_config
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PoolError::configuration("RPC_CONFIG must be specified"))?;

        if !rpc_config.keys().any(|k| is_pool_name(k)) {
            let config = PoolConfig::from_entry(rpc_config.clone(), self)?;
            return Ok(PoolPlan::Single(config));
        }

        let default = rpc_config
            .get(DEFAULT_POOL_NAME)
            .and_then(Value::as_object)
            .filter(|d| d.contains_key(BROKER_URI_KEY))
            .ok_or_else(|| {
                PoolError::configuration(format!(
                    "RPC_CONFIG must include at least a \"{DEFAULT_POOL_NAME}\" config with \"{BROKER_URI_KEY}\""
                ))
            })?;

        let mut pools = BTreeMap::new();
        for (name, entry) in rpc_config {
            if !is_pool_name(name) {
                warn!(key = %name, "Ignoring non pool key in multi pool RPC_CONFIG");
                continue;
            }
            let entry = entry.as_object().ok_or_else(|| {
                PoolError::configuration(format!("RPC_CONFIG entry \"{name}\" must be an object"))
            })?;
            let merged = if name == DEFAULT_POOL_NAME {
                default.clone()
            } else {
                merge_configs(default, entry)
            };
            pools.insert(name.clone(), PoolConfig::from_entry(merged, self)?);
        }
        Ok(PoolPlan::Multi(pools))
    }
}

/// Pools resolved from [`Settings`].
#[derive(Debug, Clone, PartialEq)]
pub enum PoolPlan {
    /// Legacy flat configuration: one pool.
    Single(PoolConfig),
    /// Named pools, each inheriting from `default`.
    Multi(BTreeMap<String, PoolConfig>),
}

impl PoolPlan {
    /// Iterate over (name, config) pairs. A single pool is named `default`.
    pub fn entries(&self) -> Vec<(&str, &PoolConfig)> {
        match self {
            PoolPlan::Single(config) => vec![(DEFAULT_POOL_NAME, config)],
            PoolPlan::Multi(pools) => pools.iter().map(|(n, c)| (n.as_str(), c)).collect(),
        }
    }
}

/// Configuration of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    /// Broker config passed to the RPC client factory (sensitive - not logged).
    #[serde(skip)]
    pub broker: BrokerConfig,
    pub pool_size: usize,
    pub context_data: Option<ContextData>,
    #[serde(rename = "timeout_secs", serialize_with = "serialize_timeout")]
    pub timeout: Option<Duration>,
}

impl PoolConfig {
    /// Create a config with default pool settings around a broker config.
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            pool_size: DEFAULT_POOL_SIZE,
            context_data: None,
            timeout: None,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_context_data(mut self, context_data: Option<ContextData>) -> Self {
        self.context_data = context_data;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a pool config from one broker config entry.
    ///
    /// `POOL_SIZE`, `POOL_CONTEXT_DATA` and `POOL_TIMEOUT` are removed from the entry
    /// and fall back to the process-wide settings when absent.
    pub fn from_entry(mut broker: BrokerConfig, defaults: &Settings) -> PoolResult<Self> {
        let pool_size = match broker.remove(POOL_SIZE_KEY) {
            None | Some(Value::Null) => defaults.pool_size_or_default(),
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    PoolError::configuration(format!(
                        "{POOL_SIZE_KEY} must be a positive integer, got {v}"
                    ))
                })?,
        };

        let context_data = match broker.remove(POOL_CONTEXT_DATA_KEY) {
            None | Some(Value::Null) => defaults.context_data.clone(),
            Some(Value::Object(data)) => Some(data),
            Some(v) => {
                return Err(PoolError::configuration(format!(
                    "{POOL_CONTEXT_DATA_KEY} must be an object, got {v}"
                )));
            }
        };

        let timeout = match broker.remove(POOL_TIMEOUT_KEY) {
            None | Some(Value::Null) => None,
            Some(v) => {
                let secs = v.as_f64().ok_or_else(|| {
                    PoolError::configuration(format!(
                        "{POOL_TIMEOUT_KEY} must be a number of seconds, got {v}"
                    ))
                })?;
                positive_duration(secs)
            }
        }
        .or_else(|| defaults.timeout_or_default());

        let config = Self {
            broker,
            pool_size,
            context_data,
            timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Broker address, if present.
    pub fn broker_uri(&self) -> Option<&str> {
        self.broker.get(BROKER_URI_KEY).and_then(Value::as_str)
    }

    /// Broker address with any password masked, for display.
    pub fn redacted_uri(&self) -> Option<String> {
        self.broker_uri().map(redact_uri)
    }

    /// Validate the config and return an error if invalid.
    pub fn validate(&self) -> PoolResult<()> {
        if self.pool_size == 0 {
            return Err(PoolError::configuration(
                "pool_size must be greater than 0",
            ));
        }
        let uri = self.broker_uri().ok_or_else(|| {
            PoolError::configuration(format!("Broker config must include \"{BROKER_URI_KEY}\""))
        })?;
        Url::parse(uri).map_err(|e| {
            PoolError::configuration(format!(
                "Invalid {BROKER_URI_KEY} '{}': {e}",
                redact_uri(uri)
            ))
        })?;
        Ok(())
    }
}

/// Source of [`Settings`]. Consulted every time the registry initializes.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> PoolResult<Settings>;
}

impl SettingsProvider for Settings {
    fn settings(&self) -> PoolResult<Settings> {
        Ok(self.clone())
    }
}

/// Settings held in memory and replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Replace the current settings. Takes effect at the next registry init.
    pub fn replace(&self, settings: Settings) {
        *self.inner.write() = settings;
    }
}

impl SettingsProvider for SharedSettings {
    fn settings(&self) -> PoolResult<Settings> {
        Ok(self.inner.read().clone())
    }
}

/// Settings read from a JSON file on every call.
#[derive(Debug, Clone)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsProvider for JsonFileSettings {
    fn settings(&self) -> PoolResult<Settings> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            PoolError::configuration(format!(
                "Cannot read settings file {}: {e}",
                self.path.display()
            ))
        })?;
        Settings::from_json_str(&raw)
    }
}

/// Deep-merge `overlay` over `base`. Keys from `overlay` win; nested objects are
/// merged recursively.
pub fn merge_configs(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let combined = match (merged.get(key), value) {
            (Some(Value::Object(b)), Value::Object(o)) => Value::Object(merge_configs(b, o)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

/// Mask the password of a broker URI. Unparseable input is masked entirely.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

/// Pool names are lower-case; broker config keys are upper-case.
fn is_pool_name(key: &str) -> bool {
    key.chars().any(char::is_lowercase) && !key.chars().any(char::is_uppercase)
}

fn positive_duration(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

fn serialize_timeout<S: Serializer>(
    timeout: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match timeout {
        Some(t) => serializer.serialize_some(&t.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Options for the `rpc-pool` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rpc-pool",
    about = "Validate RPC pool settings and print the resolved pool plan",
    version,
    author
)]
pub struct Config {
    /// Path to the JSON settings file
    #[arg(short, long, value_name = "FILE", env = "RPC_POOL_SETTINGS")]
    pub settings: PathBuf,

    /// Only print the pool with this name
    #[arg(short, long, value_name = "NAME")]
    pub pool: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "RPC_POOL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "RPC_POOL_JSON_LOGS")]
    pub json_logs: bool,
}
