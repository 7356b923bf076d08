//! Cookie parsing and matching.

use std::time::{Duration, SystemTime};

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Domain attribute without a leading dot.
    pub domain: Option<String>,
    /// Set when the domain came from the request host rather than an attribute.
    pub host_only: bool,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub expires_at: Option<SystemTime>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            host_only: false,
            path: None,
            secure: false,
            http_only: false,
            expires_at: None,
        }
    }

    /// Parse one `Set-Cookie` header value.
    ///
    /// Only `Max-Age` is honoured for expiry; `Expires` dates are ignored.
    pub fn parse_set_cookie(header: &str, now: SystemTime) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
                cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
            } else if key.eq_ignore_ascii_case("path") && val.starts_with('/') {
                cookie.path = Some(val.to_owned());
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if key.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if key.eq_ignore_ascii_case("max-age") {
                if let Ok(secs) = val.parse::<i64>() {
                    cookie.expires_at = Some(if secs <= 0 {
                        SystemTime::UNIX_EPOCH
                    } else {
                        now + Duration::from_secs(secs as u64)
                    });
                }
            }
        }
        Some(cookie)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = match &self.domain {
            Some(domain) if self.host_only => host == *domain,
            Some(domain) => domain_matches(&host, domain),
            None => false,
        };
        if !domain_ok {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        path_matches(url.path(), self.path.as_deref().unwrap_or("/"))
    }
}

/// `host` equals `domain` or is a subdomain of it.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

pub fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Default cookie path for a request path: its directory.
pub fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(i) => request_path[..i].to_owned(),
    }
}

/// Value for a request `Cookie` header.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}
