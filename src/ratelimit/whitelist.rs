//! Enforcement bypass for trusted keys and requests.

use std::collections::HashSet;

use super::key::RequestInfo;
use super::rules::LimitRule;

/// Keys and per-rule predicates that skip quota enforcement entirely.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    keys: HashSet<String>,
}

impl Whitelist {
    /// Create a whitelist from raw limiter keys.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// True when `key` is listed or `rule`'s predicate exempts `request`.
    pub fn bypass(&self, key: &str, request: &RequestInfo, rule: &LimitRule) -> bool {
        self.keys.contains(key) || rule.exempts(request)
    }

    /// Number of listed keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no keys are listed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
