//! Request descriptors and limiter key extraction.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Key used when the caller address is unknown.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// What the limiter needs to know about an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub remote_ip: Option<IpAddr>,
    /// Authenticated principal, if upstream auth ran.
    pub identity: Option<String>,
}

impl RequestInfo {
    /// Describe a request with no known caller.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            remote_ip: None,
            identity: None,
        }
    }

    /// Set the caller address.
    pub fn with_remote_ip(mut self, ip: IpAddr) -> Self {
        self.remote_ip = Some(ip);
        self
    }

    /// Set the authenticated principal.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    fn ip_key(&self) -> String {
        self.remote_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Built-in key extraction strategies, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Caller IP address
    #[default]
    Ip,
    /// Authenticated principal, falling back to caller IP
    Identity,
    /// Normalized request path
    Path,
}

/// Maps a request to the key its quota is counted under.
///
/// Fixed per limiter at construction. Extraction is pure.
#[derive(Clone)]
pub enum KeyExtractor {
    Strategy(KeyStrategy),
    Custom(Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>),
}

impl KeyExtractor {
    /// Wrap a custom extraction function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        KeyExtractor::Custom(Arc::new(f))
    }

    /// The quota key for `request`.
    pub fn extract(&self, request: &RequestInfo) -> String {
        match self {
            KeyExtractor::Strategy(KeyStrategy::Ip) => request.ip_key(),
            KeyExtractor::Strategy(KeyStrategy::Identity) => match &request.identity {
                Some(id) if !id.is_empty() => id.clone(),
                _ => request.ip_key(),
            },
            KeyExtractor::Strategy(KeyStrategy::Path) => normalize_path(&request.path),
            KeyExtractor::Custom(f) => f(request),
        }
    }
}

impl Default for KeyExtractor {
    fn default() -> Self {
        KeyExtractor::Strategy(KeyStrategy::default())
    }
}

impl From<KeyStrategy> for KeyExtractor {
    fn from(strategy: KeyStrategy) -> Self {
        KeyExtractor::Strategy(strategy)
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExtractor::Strategy(s) => f.debug_tuple("Strategy").field(s).finish(),
            KeyExtractor::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Strip the query, collapse repeated slashes and drop a trailing slash.
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request() -> RequestInfo {
        RequestInfo::new("GET", "/api//users/")
            .with_remote_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/a/b/"), "/a/b");
        assert_eq!(normalize_path("//a///b"), "/a/b");
        assert_eq!(normalize_path("/a?x=1"), "/a");
        assert_eq!(normalize_path("/a/#frag"), "/a");
    }

    #[test]
    fn test_ip_strategy() {
        let extractor = KeyExtractor::from(KeyStrategy::Ip);
        assert_eq!(extractor.extract(&request()), "10.0.0.7");
        assert_eq!(extractor.extract(&RequestInfo::new("GET", "/")), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_identity_strategy_falls_back_to_ip() {
        let extractor = KeyExtractor::from(KeyStrategy::Identity);
        assert_eq!(extractor.extract(&request().with_identity("user-42")), "user-42");
        assert_eq!(extractor.extract(&request()), "10.0.0.7");
        assert_eq!(extractor.extract(&request().with_identity("")), "10.0.0.7");
    }

    #[test]
    fn test_path_strategy() {
        let extractor = KeyExtractor::from(KeyStrategy::Path);
        assert_eq!(extractor.extract(&request()), "/api/users");
    }

    #[test]
    fn test_custom_extractor() {
        let extractor = KeyExtractor::custom(|req| format!("{}:{}", req.method, req.path));
        assert_eq!(extractor.extract(&request()), "GET:/api//users/");
        assert_eq!(format!("{:?}", extractor), "Custom(..)");
    }

    #[test]
    fn test_extraction_is_pure() {
        let extractor = KeyExtractor::default();
        let req = request();
        assert_eq!(extractor.extract(&req), extractor.extract(&req));
        assert_eq!(req, request());
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: KeyStrategy = serde_yaml::from_str("identity").unwrap();
        assert_eq!(strategy, KeyStrategy::Identity);
    }
}
