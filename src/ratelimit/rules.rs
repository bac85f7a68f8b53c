//! Limit rules and request-to-rule resolution.
//!
//! Rules are scanned in registration order and the first match wins. There is
//! no most-specific ranking: a broad rule (`"*"`) registered before a narrow
//! one shadows it. Register narrow rules first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::RequestInfo;

/// Wildcard for both paths and methods.
pub const WILDCARD: &str = "*";

/// Per-rule bypass check.
pub type WhitelistPredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// A quota applied to requests matching a path and method.
///
/// `limit < 0` is unlimited, `limit == 0` closes the route entirely, and a
/// zero `window` makes the quota lifetime instead of rolling.
#[derive(Clone)]
pub struct LimitRule {
    pub path: String,
    pub method: String,
    pub limit: i64,
    pub window: Duration,
    pub whitelist: Option<WhitelistPredicate>,
}

impl LimitRule {
    /// Create a rule for `method` requests to `path`.
    ///
    /// `method` is uppercased here so configuration may write `post`; matching
    /// itself is exact.
    pub fn new(
        path: impl Into<String>,
        method: impl Into<String>,
        limit: i64,
        window: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            method: method.into().to_ascii_uppercase(),
            limit,
            window,
            whitelist: None,
        }
    }

    /// Create a rule matching every request.
    pub fn catch_all(limit: i64, window: Duration) -> Self {
        Self::new(WILDCARD, WILDCARD, limit, window)
    }

    /// Attach a bypass predicate.
    pub fn with_whitelist<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.whitelist = Some(Arc::new(predicate));
        self
    }

    /// Whether this rule applies to `path` and `method`.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        let path_ok = self.path == WILDCARD || self.path == path;
        let method_ok = self.method == WILDCARD || self.method == method;
        path_ok && method_ok
    }

    /// Whether this rule's predicate exempts `request`.
    pub fn exempts(&self, request: &RequestInfo) -> bool {
        self.whitelist.as_ref().is_some_and(|predicate| predicate(request))
    }

    /// Storage namespace for this rule, so quotas under different rules never mix.
    pub fn scope(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

impl fmt::Debug for LimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitRule")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("whitelist", &self.whitelist.is_some())
            .finish()
    }
}

/// Ordered rules plus the fallback used when none match.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<LimitRule>,
    default_rule: LimitRule,
}

impl RuleSet {
    /// Create a rule set with only a default rule.
    pub fn new(default_rule: LimitRule) -> Self {
        Self {
            rules: Vec::new(),
            default_rule,
        }
    }

    /// Create a rule set from `rules` in priority order.
    pub fn with_rules(rules: Vec<LimitRule>, default_rule: LimitRule) -> Self {
        Self {
            rules,
            default_rule,
        }
    }

    /// Append a rule after all existing ones.
    pub fn push(&mut self, rule: LimitRule) {
        self.rules.push(rule);
    }

    /// First rule matching `path` and `method`, else the default rule.
    pub fn resolve(&self, path: &str, method: &str) -> &LimitRule {
        self.rules
            .iter()
            .find(|rule| rule.matches(path, method))
            .unwrap_or(&self.default_rule)
    }

    /// Registered rules in priority order, excluding the default.
    pub fn rules(&self) -> &[LimitRule] {
        &self.rules
    }

    /// The fallback rule.
    pub fn default_rule(&self) -> &LimitRule {
        &self.default_rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_exact_match_and_default() {
        let rules = RuleSet::with_rules(
            vec![LimitRule::new("/a", "GET", 5, MINUTE)],
            LimitRule::catch_all(100, MINUTE),
        );

        assert_eq!(rules.resolve("/a", "GET").limit, 5);
        assert_eq!(rules.resolve("/a", "POST").limit, 100);
        assert_eq!(rules.resolve("/b", "GET").limit, 100);
    }

    #[test]
    fn test_explicit_catch_all_rule() {
        let rules = RuleSet::with_rules(
            vec![
                LimitRule::new("/a", "GET", 1, MINUTE),
                LimitRule::catch_all(7, MINUTE),
            ],
            LimitRule::catch_all(100, MINUTE),
        );

        assert_eq!(rules.resolve("/a", "GET").limit, 1);
        assert_eq!(rules.resolve("/a", "POST").limit, 7);
    }

    #[test]
    fn test_first_match_wins_over_specificity() {
        let rules = RuleSet::with_rules(
            vec![
                LimitRule::new("*", "GET", 50, MINUTE),
                LimitRule::new("/login", "GET", 3, MINUTE),
            ],
            LimitRule::catch_all(100, MINUTE),
        );

        // The broad rule was registered first, so it shadows the narrow one.
        assert_eq!(rules.resolve("/login", "GET").limit, 50);
    }

    #[test]
    fn test_method_wildcard() {
        let rules = RuleSet::with_rules(
            vec![
                LimitRule::new("/upload", "*", 2, MINUTE),
                LimitRule::new("/items", "post", 4, MINUTE),
            ],
            LimitRule::catch_all(-1, Duration::ZERO),
        );

        assert_eq!(rules.resolve("/upload", "PUT").limit, 2);
        assert_eq!(rules.resolve("/upload", "DELETE").limit, 2);
        assert_eq!(rules.resolve("/items", "POST").limit, 4);
        assert_eq!(rules.resolve("/items", "GET").limit, -1);
    }

    #[test]
    fn test_method_match_is_exact() {
        let rules = RuleSet::with_rules(
            vec![LimitRule::new("/items", "post", 4, MINUTE)],
            LimitRule::catch_all(-1, Duration::ZERO),
        );

        assert_eq!(rules.rules()[0].method, "POST");
        assert_eq!(rules.resolve("/items", "POST").limit, 4);
        assert_eq!(rules.resolve("/items", "post").limit, -1);
    }

    #[test]
    fn test_push_appends_lowest_priority() {
        let mut rules = RuleSet::new(LimitRule::catch_all(100, MINUTE));
        rules.push(LimitRule::new("/a", "GET", 1, MINUTE));
        rules.push(LimitRule::new("/a", "GET", 2, MINUTE));

        assert_eq!(rules.rules().len(), 2);
        assert_eq!(rules.resolve("/a", "GET").limit, 1);
        assert_eq!(rules.default_rule().limit, 100);
    }

    #[test]
    fn test_whitelist_predicate() {
        let rule = LimitRule::new("/a", "GET", 0, MINUTE)
            .with_whitelist(|req: &RequestInfo| req.identity.as_deref() == Some("admin"));

        let admin = RequestInfo::new("GET", "/a").with_identity("admin");
        let guest = RequestInfo::new("GET", "/a").with_identity("guest");

        assert!(rule.exempts(&admin));
        assert!(!rule.exempts(&guest));
        assert!(!LimitRule::catch_all(1, MINUTE).exempts(&admin));
    }

    #[test]
    fn test_scope() {
        assert_eq!(LimitRule::new("/a", "get", 1, MINUTE).scope(), "GET /a");
        assert_eq!(LimitRule::catch_all(1, MINUTE).scope(), "* *");
    }
}
