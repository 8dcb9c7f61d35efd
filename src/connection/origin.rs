//! Origin allow-list applied before a WebSocket upgrade

use axum::http::HeaderValue;

/// Decides whether an upgrade request's `Origin` header is acceptable
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|o| normalize(o)).collect(),
        }
    }

    /// True when no allow-list is configured.
    pub fn is_open(&self) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|o| o == "*")
    }

    /// Requests without an `Origin` header come from non-browser clients and are accepted.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        match origin {
            None => true,
            Some(origin) => {
                let origin = normalize(origin);
                self.allowed.iter().any(|allowed| *allowed == origin)
            }
        }
    }

    /// Check a raw `Origin` header. A header that is present but not readable
    /// text only passes an open policy.
    pub fn allows_header(&self, origin: Option<&HeaderValue>) -> bool {
        match origin.map(HeaderValue::to_str) {
            None => self.is_allowed(None),
            Some(Ok(origin)) => self.is_allowed(Some(origin)),
            Some(Err(_)) => self.is_open(),
        }
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str]) -> OriginPolicy {
        let origins: Vec<String> = origins.iter().map(|o| o.to_string()).collect();
        OriginPolicy::new(&origins)
    }

    #[test]
    fn test_empty_list_allows_everything() {
        let policy = policy(&[]);
        assert!(policy.is_open());
        assert!(policy.is_allowed(Some("https://anything.example")));
        assert!(policy.is_allowed(None));
    }

    #[test]
    fn test_wildcard_allows_everything() {
        assert!(policy(&["*"]).is_allowed(Some("https://anything.example")));
    }

    #[test]
    fn test_allow_list_matching() {
        let policy = policy(&["https://app.example.com/", "http://localhost:3000"]);

        assert!(policy.is_allowed(Some("https://app.example.com")));
        assert!(policy.is_allowed(Some("HTTPS://APP.EXAMPLE.COM")));
        assert!(policy.is_allowed(Some("http://localhost:3000")));
        assert!(!policy.is_allowed(Some("https://evil.example.com")));
        assert!(!policy.is_allowed(Some("http://localhost:3001")));
    }

    #[test]
    fn test_missing_origin_accepted() {
        assert!(policy(&["https://app.example.com"]).is_allowed(None));
    }

    #[test]
    fn test_unreadable_origin_header() {
        let garbled = HeaderValue::from_bytes(b"https://app.example.com\xff").unwrap();
        let listed = policy(&["https://app.example.com"]);

        assert!(!listed.allows_header(Some(&garbled)));
        assert!(listed.allows_header(None));
        assert!(listed.allows_header(Some(&HeaderValue::from_static("https://app.example.com"))));
        assert!(policy(&[]).allows_header(Some(&garbled)));
    }
}
