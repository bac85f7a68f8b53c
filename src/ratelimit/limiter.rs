//! Core admission orchestrator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::backend::{build_storage, Storage, StorageKind, StorageOptions};
use super::key::{KeyExtractor, RequestInfo};
use super::rules::{LimitRule, RuleSet};
use super::stats::{Stats, StatsSnapshot};
use super::whitelist::Whitelist;

/// Default status code for rejected requests.
pub const DEFAULT_DENY_STATUS: u16 = 429;
/// Default message for rejected requests.
pub const DEFAULT_DENY_MESSAGE: &str = "too many requests";

/// What to do when the storage backend cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Reject the request
    #[default]
    Closed,
    /// Admit the request
    Open,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Continue the handler chain. `bypassed` is set when the whitelist
    /// skipped enforcement.
    Admitted { bypassed: bool },
    /// Stop the chain and emit the deny response.
    Rejected,
}

impl Decision {
    /// True for both enforced and bypassed admissions.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// JSON body sent with a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyBody {
    pub code: u16,
    pub message: String,
}

/// Fixed limiter configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub deny_status: u16,
    pub deny_message: String,
    pub failure_policy: FailurePolicy,
    pub whitelist: Whitelist,
    pub key_extractor: KeyExtractor,
    pub rules: RuleSet,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            deny_status: DEFAULT_DENY_STATUS,
            deny_message: DEFAULT_DENY_MESSAGE.to_string(),
            failure_policy: FailurePolicy::default(),
            whitelist: Whitelist::default(),
            key_extractor: KeyExtractor::default(),
            rules: RuleSet::new(LimitRule::catch_all(-1, Duration::ZERO)),
        }
    }
}

/// The admission controller shared by every request task.
///
/// Owned by whoever builds the application and handed to the middleware;
/// nothing here is global.
pub struct RateLimiter {
    config: LimiterConfig,
    storage: Arc<dyn Storage>,
    stats: Stats,
}

impl RateLimiter {
    /// Create a limiter over an already-built storage backend.
    pub fn new(config: LimiterConfig, storage: Arc<dyn Storage>) -> Self {
        info!(
            storage = %storage.kind(),
            rules = config.rules.rules().len(),
            whitelist = config.whitelist.len(),
            "Rate limiter initialized"
        );
        Self {
            config,
            storage,
            stats: Stats::new(),
        }
    }

    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Decide whether `request` may proceed.
    pub async fn check(&self, request: &RequestInfo) -> Decision {
        self.stats.record_request();

        let key = self.config.key_extractor.extract(request);
        let rule = self.config.rules.resolve(&request.path, &request.method);

        if self.config.whitelist.bypass(&key, request, rule) {
            trace!(key = %key, path = %request.path, "Whitelisted, skipping enforcement");
            return Decision::Admitted { bypassed: true };
        }

        let storage_key = format!("{}|{}", rule.scope(), key);
        trace!(
            key = %storage_key,
            limit = rule.limit,
            window_ms = rule.window.as_millis() as u64,
            "Checking rate limit"
        );

        let allowed = match self.storage.allow(&storage_key, rule.limit, rule.window).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    key = %storage_key,
                    error = %e,
                    policy = ?self.config.failure_policy,
                    "Storage failure during rate limit check"
                );
                self.config.failure_policy == FailurePolicy::Open
            }
        };

        if allowed {
            Decision::Admitted { bypassed: false }
        } else {
            self.stats.record_rejection();
            debug!(key = %storage_key, limit = rule.limit, "Rate limit exceeded");
            Decision::Rejected
        }
    }

    /// Current request and rejection totals.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Status code for rejected requests.
    pub fn deny_status(&self) -> u16 {
        self.config.deny_status
    }

    /// JSON body for rejected requests.
    pub fn deny_body(&self) -> DenyBody {
        DenyBody {
            code: self.config.deny_status,
            message: self.config.deny_message.clone(),
        }
    }

    /// Which storage backend is in use, after any fallback.
    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }

    /// The fixed configuration this limiter was built with.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    config: LimiterConfig,
    rules: Vec<LimitRule>,
    default_rule: Option<LimitRule>,
    storage: Option<Arc<dyn Storage>>,
    storage_options: StorageOptions,
}

impl RateLimiterBuilder {
    /// Register a rule after all previously registered ones.
    pub fn rule(mut self, rule: LimitRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Rule applied when nothing else matches.
    pub fn default_rule(mut self, rule: LimitRule) -> Self {
        self.default_rule = Some(rule);
        self
    }

    /// Keys that skip enforcement.
    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.config.whitelist = whitelist;
        self
    }

    /// How requests map to quota keys.
    pub fn key_extractor(mut self, extractor: impl Into<KeyExtractor>) -> Self {
        self.config.key_extractor = extractor.into();
        self
    }

    /// Status and message sent with rejections.
    pub fn deny(mut self, status: u16, message: impl Into<String>) -> Self {
        self.config.deny_status = status;
        self.config.deny_message = message.into();
        self
    }

    /// Whether storage failures reject or admit.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Use a prebuilt storage backend, ignoring any storage options.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Describe the storage backend to build.
    pub fn storage_options(mut self, options: StorageOptions) -> Self {
        self.storage_options = options;
        self
    }

    /// Build the limiter, creating storage from the options if none was given.
    pub fn build(self) -> RateLimiter {
        let mut config = self.config;
        let default_rule = self
            .default_rule
            .unwrap_or_else(|| config.rules.default_rule().clone());
        config.rules = RuleSet::with_rules(self.rules, default_rule);

        let storage = self
            .storage
            .unwrap_or_else(|| build_storage(self.storage_options));
        RateLimiter::new(config, storage)
    }
}
