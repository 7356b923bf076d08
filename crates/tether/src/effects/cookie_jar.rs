use std::cell::RefCell;
use std::time::SystemTime;

use tracing::{debug, trace};
use url::Url;

use crate::core::{Cookie, default_path, domain_matches};

/// Cookie storage consulted when building requests and processing replies.
pub trait CookieJar {
    fn cookies_for_url(&self, url: &Url) -> Vec<Cookie>;

    /// Store cookies received from `url`. Returns `true` if any was accepted.
    fn set_cookies_from_url(&self, cookies: Vec<Cookie>, url: &Url) -> bool;
}

/// In-memory jar with host and path matching.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: RefCell<Vec<Cookie>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_cookies(&self) -> Vec<Cookie> {
        self.cookies.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.cookies.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.cookies.borrow_mut().clear();
    }
}

impl CookieJar for MemoryCookieJar {
    fn cookies_for_url(&self, url: &Url) -> Vec<Cookie> {
        let now = SystemTime::now();
        let mut cookies = self.cookies.borrow_mut();
        cookies.retain(|c| !c.is_expired(now));
        let mut matching: Vec<Cookie> = cookies.iter().filter(|c| c.matches(url)).cloned().collect();
        // Longer paths first.
        matching.sort_by_key(|c| std::cmp::Reverse(c.path.as_ref().map_or(0, String::len)));
        matching
    }

    fn set_cookies_from_url(&self, cookies: Vec<Cookie>, url: &Url) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        let now = SystemTime::now();
        let mut jar = self.cookies.borrow_mut();
        let mut accepted = false;
        for mut cookie in cookies {
            match &cookie.domain {
                Some(domain) if !domain_matches(&host, domain) => {
                    debug!(name = %cookie.name, %domain, %host, "cookie rejected for foreign domain");
                    continue;
                }
                Some(_) => {}
                None => {
                    cookie.domain = Some(host.clone());
                    cookie.host_only = true;
                }
            }
            if cookie.path.is_none() {
                cookie.path = Some(default_path(url.path()));
            }
            jar.retain(|c| {
                !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
            });
            if cookie.is_expired(now) {
                trace!(name = %cookie.name, "expired cookie deleted");
                continue;
            }
            trace!(name = %cookie.name, "cookie stored");
            jar.push(cookie);
            accepted = true;
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn parse(s: &str) -> Cookie {
        Cookie::parse_set_cookie(s, SystemTime::now()).unwrap()
    }

    #[test]
    fn test_host_only_cookie() {
        let jar = MemoryCookieJar::new();
        assert!(jar.set_cookies_from_url(vec![parse("a=1")], &url("http://example.com/docs/page")));
        assert_eq!(jar.cookies_for_url(&url("http://example.com/docs/other")).len(), 1);
        assert!(jar.cookies_for_url(&url("http://example.com/")).is_empty());
        assert!(jar.cookies_for_url(&url("http://www.example.com/docs/x")).is_empty());
    }

    #[test]
    fn test_domain_cookie_reaches_subdomains() {
        let jar = MemoryCookieJar::new();
        jar.set_cookies_from_url(vec![parse("a=1; Domain=example.com; Path=/")], &url("http://example.com/"));
        assert_eq!(jar.cookies_for_url(&url("http://www.example.com/x")).len(), 1);
    }

    #[test]
    fn test_foreign_domain_rejected() {
        let jar = MemoryCookieJar::new();
        let ok = jar.set_cookies_from_url(vec![parse("a=1; Domain=other.com")], &url("http://example.com/"));
        assert!(!ok);
        assert!(jar.is_empty());
    }

    #[test]
    fn test_replace_and_delete() {
        let jar = MemoryCookieJar::new();
        let site = url("http://example.com/");
        jar.set_cookies_from_url(vec![parse("a=1")], &site);
        jar.set_cookies_from_url(vec![parse("a=2")], &site);
        let cookies = jar.cookies_for_url(&site);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "2");

        jar.set_cookies_from_url(vec![parse("a=x; Max-Age=0")], &site);
        assert!(jar.cookies_for_url(&site).is_empty());
    }
}
