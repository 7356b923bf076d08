use url::Url;

/// A route a networked backend may take to reach its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proxy {
    /// Connect directly.
    NoProxy,
    /// Tunnel through an HTTP proxy.
    Http(Url),
}

impl Proxy {
    pub fn url(&self) -> Option<&Url> {
        match self {
            Proxy::NoProxy => None,
            Proxy::Http(url) => Some(url),
        }
    }
}

/// TLS settings handed to backends that support them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfiguration {
    /// Extra trust anchors, PEM encoded.
    pub root_certificates: Vec<Vec<u8>>,
    /// Skip certificate verification entirely.
    pub accept_invalid_certificates: bool,
}

impl SslConfiguration {
    #[must_use]
    pub fn add_root_certificate(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_certificates.push(pem.into());
        self
    }

    #[must_use]
    pub fn accept_invalid_certificates(mut self, accept: bool) -> Self {
        self.accept_invalid_certificates = accept;
        self
    }
}
