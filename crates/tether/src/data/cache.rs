use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use url::Url;

use super::attributes::ReplyAttributes;
use super::headers::RawHeaders;
use crate::core::CacheControl;

/// What a cache store keeps next to a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetaData {
    pub url: Url,
    pub headers: RawHeaders,
    pub attributes: ReplyAttributes,
    pub saved_at: SystemTime,
    pub expires_at: Option<SystemTime>,
}

impl CacheMetaData {
    /// Metadata for a response received now, with an expiry taken from
    /// its `Cache-Control: max-age`.
    pub fn from_response(url: Url, headers: RawHeaders, attributes: ReplyAttributes) -> Self {
        let saved_at = SystemTime::now();
        let expires_at = headers
            .get("Cache-Control")
            .map(CacheControl::parse)
            .and_then(|cc| cc.s_maxage.or(cc.max_age))
            .map(|secs| saved_at + Duration::from_secs(secs));
        Self {
            url,
            headers,
            attributes,
            saved_at,
            expires_at,
        }
    }

    /// Entries without an expiry never count as fresh.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at > now)
    }
}

/// Sink a reply fills while downloading, then hands to the store.
#[derive(Debug)]
pub struct CacheWriter {
    meta: CacheMetaData,
    body: BytesMut,
}

impl CacheWriter {
    pub fn new(meta: CacheMetaData) -> Self {
        Self {
            meta,
            body: BytesMut::new(),
        }
    }

    pub fn meta(&self) -> &CacheMetaData {
        &self.meta
    }

    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn into_parts(self) -> (CacheMetaData, Bytes) {
        (self.meta, self.body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(cache_control: Option<&str>) -> CacheMetaData {
        let mut headers = RawHeaders::new();
        if let Some(cc) = cache_control {
            headers.set("Cache-Control", cc);
        }
        CacheMetaData::from_response(
            Url::parse("http://example.com/a").unwrap(),
            headers,
            ReplyAttributes::default(),
        )
    }

    #[test]
    fn test_max_age_sets_expiry() {
        let meta = meta(Some("public, max-age=60"));
        assert_eq!(meta.expires_at, Some(meta.saved_at + Duration::from_secs(60)));
        assert!(meta.is_fresh(meta.saved_at));
        assert!(!meta.is_fresh(meta.saved_at + Duration::from_secs(61)));
    }

    #[test]
    fn test_no_max_age_is_never_fresh() {
        let meta = meta(None);
        assert!(!meta.is_fresh(meta.saved_at));
    }

    #[test]
    fn test_writer_collects_body() {
        let mut writer = CacheWriter::new(meta(None));
        writer.write(b"ab");
        writer.write(b"cd");
        assert_eq!(writer.len(), 4);
        let (_, body) = writer.into_parts();
        assert_eq!(body, Bytes::from_static(b"abcd"));
    }
}
