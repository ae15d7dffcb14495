use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub platform: Platform,
    #[serde(default)]
    pub idempotency: Idempotency,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub cards: Cards,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub inventory: Inventory,
    pub audit: Audit,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

/// Messaging/approval platform credentials and client behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub host: String,
    pub app_id: String,
    pub app_secret: String,
    #[serde(default)]
    pub verification_token: Option<String>,
    pub approval_code: String,
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idempotency {
    pub ttl_secs: u64,
}

impl Default for Idempotency {
    fn default() -> Self {
        Self { ttl_secs: 3_600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u64,
    pub window_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: 1,
            window_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cards {
    pub freshness_secs: u64,
}

impl Default for Cards {
    fn default() -> Self {
        // Twelve days.
        Self {
            freshness_secs: 1_036_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    pub mode: String,
    pub queue_capacity: usize,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            mode: "background".to_string(),
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    pub warehouse_label: String,
    /// User ids granted administrator rights at startup.
    #[serde(default)]
    pub root_users: Vec<String>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            warehouse_label: "warehouse".to_string(),
            root_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub filter: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            filter: "lendbot=info,lendbot_server=info".to_string(),
        }
    }
}

fn default_webhook_path() -> String {
    "/".to_string()
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !cfg.server.webhook_path.starts_with('/') {
        return Err(ConfigError::UnsupportedConfig(
            "server.webhook_path must start with '/'".to_string(),
        ));
    }
    if cfg.platform.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "platform.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.rate_limit.window_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.window_ms must be >= 1".to_string(),
        ));
    }
    if cfg.cards.freshness_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cards.freshness_secs must be >= 1".to_string(),
        ));
    }
    if cfg.dispatch.mode != "background" && cfg.dispatch.mode != "inline" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "dispatch.mode={} is not implemented; supported: background, inline",
            cfg.dispatch.mode
        )));
    }
    if cfg.dispatch.mode == "background" && cfg.dispatch.queue_capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dispatch.queue_capacity must be >= 1 in background mode".to_string(),
        ));
    }
    Ok(())
}
