//! Configuration management for Turnstile.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    FailurePolicy, KeyStrategy, LimitRule, RateLimiter, StorageKind, StorageOptions, SystemClock,
    Whitelist, DEFAULT_DENY_MESSAGE, DEFAULT_DENY_STATUS, DEFAULT_SWEEP_WORKERS, WILDCARD,
};

/// Prefix for environment overrides, e.g. `TURNSTILE__LIMITER__DENY_STATUS=503`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Status code sent with rejections
    #[serde(default = "default_deny_status")]
    pub deny_status: u16,

    /// Message sent with rejections
    #[serde(default = "default_deny_message")]
    pub deny_message: String,

    /// Whether storage failures reject or admit
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// How requests map to quota keys
    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Keys that are never limited
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageSettings,

    /// Rule applied when no other rule matches
    #[serde(default)]
    pub default_rule: RuleSettings,

    /// Rules in priority order; the first match wins
    #[serde(default)]
    pub rules: Vec<RuleSettings>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            deny_status: default_deny_status(),
            deny_message: default_deny_message(),
            failure_policy: FailurePolicy::default(),
            key_strategy: KeyStrategy::default(),
            whitelist: Vec::new(),
            storage: StorageSettings::default(),
            default_rule: RuleSettings::default(),
            rules: Vec::new(),
        }
    }
}

fn default_deny_status() -> u16 {
    DEFAULT_DENY_STATUS
}

fn default_deny_message() -> String {
    DEFAULT_DENY_MESSAGE.to_string()
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// `memory` or `remote`
    #[serde(default)]
    pub kind: StorageKind,

    /// Memory store shard count (rounded up to a power of two)
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Memory store cleanup workers
    #[serde(default = "default_sweep_workers")]
    pub sweep_workers: usize,

    /// Redis URL for the remote store
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            shard_count: default_shard_count(),
            sweep_workers: default_sweep_workers(),
            redis_url: None,
        }
    }
}

fn default_shard_count() -> usize {
    16
}

fn default_sweep_workers() -> usize {
    DEFAULT_SWEEP_WORKERS
}

/// One rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSettings {
    /// Exact path or `*`
    #[serde(default = "wildcard")]
    pub path: String,

    /// HTTP method or `*`
    #[serde(default = "wildcard")]
    pub method: String,

    /// Requests per window; -1 is unlimited, 0 rejects everything
    #[serde(default = "unlimited")]
    pub limit: i64,

    /// Window length in seconds; zero or negative never expires
    #[serde(default)]
    pub window_secs: f64,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            path: wildcard(),
            method: wildcard(),
            limit: unlimited(),
            window_secs: 0.0,
        }
    }
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

fn unlimited() -> i64 {
    -1
}

impl RuleSettings {
    /// Window as a duration; anything non-positive or unrepresentable is "no expiry".
    pub fn window(&self) -> Duration {
        if self.window_secs > 0.0 {
            Duration::try_from_secs_f64(self.window_secs).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }
}

impl From<&RuleSettings> for LimitRule {
    fn from(settings: &RuleSettings) -> Self {
        LimitRule::new(
            settings.path.clone(),
            settings.method.clone(),
            settings.limit,
            settings.window(),
        )
    }
}

impl LimiterSettings {
    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(400..=599).contains(&self.deny_status) {
            return Err(TurnstileError::Config(format!(
                "deny_status must be a 4xx or 5xx code, got {}",
                self.deny_status
            )));
        }
        if self.storage.shard_count == 0 {
            return Err(TurnstileError::Config("shard_count must be at least 1".to_string()));
        }
        if self.storage.sweep_workers == 0 {
            return Err(TurnstileError::Config("sweep_workers must be at least 1".to_string()));
        }
        if let Some(rule) = self.rules.iter().find(|r| r.path.is_empty() || r.method.is_empty()) {
            return Err(TurnstileError::Config(format!(
                "rule path and method must not be empty: {:?}",
                rule
            )));
        }
        Ok(())
    }

    /// Storage options for these settings.
    ///
    /// A remote store without a usable client is left for the storage factory
    /// to replace with the memory store.
    pub fn storage_options(&self) -> StorageOptions {
        let redis_client = match (&self.storage.kind, &self.storage.redis_url) {
            (StorageKind::Remote, Some(url)) => match redis::Client::open(url.as_str()) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "Invalid Redis URL");
                    None
                }
            },
            _ => None,
        };

        StorageOptions {
            kind: self.storage.kind,
            shard_count: self.storage.shard_count,
            sweep_workers: self.storage.sweep_workers,
            redis_client,
            clock: Arc::new(SystemClock),
        }
    }

    /// Validate and build a limiter.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        self.validate()?;

        let builder = self.rules.iter().fold(RateLimiter::builder(), |builder, rule| {
            builder.rule(LimitRule::from(rule))
        });

        Ok(builder
            .default_rule(LimitRule::from(&self.default_rule))
            .whitelist(Whitelist::new(self.whitelist.iter().cloned()))
            .key_extractor(self.key_strategy)
            .deny(self.deny_status, self.deny_message.clone())
            .failure_policy(self.failure_policy)
            .storage_options(self.storage_options())
            .build())
    }
}

impl TurnstileConfig {
    /// Load configuration from a file, with environment overrides on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
