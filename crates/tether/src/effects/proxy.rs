use url::Url;

use crate::data::Proxy;

/// Picks the routes a networked backend may use for a URL.
pub trait ProxyResolver {
    /// Candidates, best first. An empty list fails the request.
    fn resolve(&self, url: &Url) -> Vec<Proxy>;
}

/// Always connects directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProxyResolver;

impl ProxyResolver for NoProxyResolver {
    fn resolve(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::NoProxy]
    }
}

/// Returns the same list for every URL.
#[derive(Debug, Clone, Default)]
pub struct StaticProxyResolver {
    proxies: Vec<Proxy>,
}

impl StaticProxyResolver {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self { proxies }
    }
}

impl ProxyResolver for StaticProxyResolver {
    fn resolve(&self, _url: &Url) -> Vec<Proxy> {
        self.proxies.clone()
    }
}
