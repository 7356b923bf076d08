use std::cell::RefCell;
use std::collections::HashMap;
use std::time::SystemTime;

use tracing::debug;
use url::Url;

/// Known Strict-Transport-Security hosts.
pub trait HstsStore {
    /// Whether `url`'s host has a live policy.
    fn is_known_host(&self, url: &Url) -> bool;

    fn add_policy(&self, host: &str, expiry: SystemTime, include_subdomains: bool);

    fn clear(&self);
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    expiry: SystemTime,
    include_subdomains: bool,
}

#[derive(Debug, Default)]
pub struct HstsCache {
    policies: RefCell<HashMap<String, Policy>>,
}

impl HstsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.policies.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.borrow().is_empty()
    }
}

impl HstsStore for HstsCache {
    fn is_known_host(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let now = SystemTime::now();
        let mut policies = self.policies.borrow_mut();
        policies.retain(|_, p| p.expiry > now);

        if policies.contains_key(&host) {
            return true;
        }
        // Walk up the parent domains looking for include-subdomains policies.
        let mut rest = host.as_str();
        while let Some((_, parent)) = rest.split_once('.') {
            if policies.get(parent).is_some_and(|p| p.include_subdomains) {
                return true;
            }
            rest = parent;
        }
        false
    }

    fn add_policy(&self, host: &str, expiry: SystemTime, include_subdomains: bool) {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if expiry <= SystemTime::now() {
            debug!(%host, "HSTS policy removed");
            self.policies.borrow_mut().remove(&host);
            return;
        }
        debug!(%host, include_subdomains, "HSTS policy added");
        self.policies.borrow_mut().insert(
            host,
            Policy {
                expiry,
                include_subdomains,
            },
        );
    }

    fn clear(&self) {
        self.policies.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn later() -> SystemTime {
        SystemTime::now() + Duration::from_secs(3600)
    }

    #[test]
    fn test_exact_host() {
        let hsts = HstsCache::new();
        hsts.add_policy("Example.com", later(), false);
        assert!(hsts.is_known_host(&url("http://example.com/")));
        assert!(!hsts.is_known_host(&url("http://www.example.com/")));
    }

    #[test]
    fn test_include_subdomains() {
        let hsts = HstsCache::new();
        hsts.add_policy("example.com", later(), true);
        assert!(hsts.is_known_host(&url("http://a.b.example.com/")));
        assert!(!hsts.is_known_host(&url("http://notexample.com/")));
    }

    #[test]
    fn test_expired_policy_is_dropped() {
        let hsts = HstsCache::new();
        hsts.add_policy("example.com", later(), false);
        hsts.add_policy("example.com", SystemTime::UNIX_EPOCH, false);
        assert!(!hsts.is_known_host(&url("http://example.com/")));
        assert!(hsts.is_empty());
    }
}
