use std::any::Any;
use std::fmt;
use std::rc::Weak;

use url::Url;

use super::attributes::RequestAttributes;
use super::headers::{KnownHeader, RawHeaders};
use super::network::SslConfiguration;
use crate::error::Result;

/// Request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Head,
    Get,
    Put,
    Post,
    Delete,
    /// Verb taken from [`RequestAttributes::custom_verb`].
    Custom,
}

impl Operation {
    /// Whether the operation normally carries a request body.
    pub fn has_body(self) -> bool {
        matches!(self, Operation::Put | Operation::Post | Operation::Custom)
    }

    pub fn method(self) -> Option<&'static str> {
        match self {
            Operation::Head => Some("HEAD"),
            Operation::Get => Some("GET"),
            Operation::Put => Some("PUT"),
            Operation::Post => Some("POST"),
            Operation::Delete => Some("DELETE"),
            Operation::Custom => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method().unwrap_or("CUSTOM"))
    }
}

/// A declarative network request.
///
/// # Examples
///
/// ```
/// use tether::{KnownHeader, Request};
///
/// let request = Request::parse("https://example.com/index.html")
///     .unwrap()
///     .with_header(KnownHeader::UserAgent, "tether")
///     .with_raw_header("Accept", "text/html");
/// assert_eq!(request.header(KnownHeader::UserAgent), Some("tether"));
/// assert_eq!(request.raw_header("accept"), Some("text/html"));
/// ```
#[derive(Clone)]
pub struct Request {
    url: Url,
    headers: RawHeaders,
    attributes: RequestAttributes,
    ssl: Option<SslConfiguration>,
    originator: Option<Weak<dyn Any>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("attributes", &self.attributes)
            .field("ssl", &self.ssl)
            .field("originator", &self.originator.is_some())
            .finish()
    }
}

impl Request {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: RawHeaders::new(),
            attributes: RequestAttributes::default(),
            ssl: None,
            originator: None,
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub fn header(&self, header: KnownHeader) -> Option<&str> {
        self.headers.get(header.name())
    }

    pub fn set_header(&mut self, header: KnownHeader, value: impl Into<String>) {
        self.headers.set(header.name(), value);
    }

    #[must_use]
    pub fn with_header(mut self, header: KnownHeader, value: impl Into<String>) -> Self {
        self.set_header(header, value);
        self
    }

    pub fn raw_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_raw_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    #[must_use]
    pub fn with_raw_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_raw_header(name, value);
        self
    }

    pub fn remove_raw_header(&mut self, name: &str) -> bool {
        self.headers.remove(name)
    }

    pub fn headers(&self) -> &RawHeaders {
        &self.headers
    }

    pub fn attributes(&self) -> &RequestAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut RequestAttributes {
        &mut self.attributes
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: RequestAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn ssl_configuration(&self) -> Option<&SslConfiguration> {
        self.ssl.as_ref()
    }

    pub fn set_ssl_configuration(&mut self, config: SslConfiguration) {
        self.ssl = Some(config);
    }

    /// Object that issued the request, kept weakly for diagnostics.
    pub fn originator(&self) -> Option<&Weak<dyn Any>> {
        self.originator.as_ref()
    }

    pub fn set_originator(&mut self, originator: Weak<dyn Any>) {
        self.originator = Some(originator);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Request::parse("not a url").is_err());
    }

    #[test]
    fn test_operation_body() {
        assert!(Operation::Post.has_body());
        assert!(Operation::Put.has_body());
        assert!(!Operation::Get.has_body());
        assert!(!Operation::Delete.has_body());
        assert_eq!(Operation::Custom.method(), None);
    }

    #[test]
    fn test_originator_is_weak() {
        let owner: Rc<dyn Any> = Rc::new(5u32);
        let mut request = Request::parse("http://example.com/").unwrap();
        request.set_originator(Rc::downgrade(&owner));
        assert!(request.originator().and_then(Weak::upgrade).is_some());
        drop(owner);
        assert!(request.originator().and_then(Weak::upgrade).is_none());
    }
}
