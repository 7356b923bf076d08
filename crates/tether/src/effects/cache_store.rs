use std::cell::RefCell;
use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, trace};
use url::Url;

use crate::data::{CacheMetaData, CacheWriter};

/// Response cache consulted by the manager and filled by replies.
pub trait CacheStore {
    fn meta_data(&self, url: &Url) -> Option<CacheMetaData>;

    fn data(&self, url: &Url) -> Option<Bytes>;

    /// A sink for a response about to be downloaded, or `None` to skip saving.
    fn prepare(&self, meta: CacheMetaData) -> Option<CacheWriter>;

    /// Commit a fully written sink.
    fn insert(&self, writer: CacheWriter);

    fn remove(&self, url: &Url) -> bool;

    fn clear(&self);
}

/// Unbounded in-memory cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RefCell<HashMap<String, (CacheMetaData, Bytes)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Store a response directly, bypassing a reply.
    pub fn put(&self, meta: CacheMetaData, body: impl Into<Bytes>) {
        self.entries
            .borrow_mut()
            .insert(meta.url.as_str().to_owned(), (meta, body.into()));
    }
}

impl CacheStore for MemoryCache {
    fn meta_data(&self, url: &Url) -> Option<CacheMetaData> {
        self.entries.borrow().get(url.as_str()).map(|(m, _)| m.clone())
    }

    fn data(&self, url: &Url) -> Option<Bytes> {
        self.entries.borrow().get(url.as_str()).map(|(_, b)| b.clone())
    }

    fn prepare(&self, meta: CacheMetaData) -> Option<CacheWriter> {
        trace!(url = %meta.url, "cache entry prepared");
        Some(CacheWriter::new(meta))
    }

    fn insert(&self, writer: CacheWriter) {
        let (meta, body) = writer.into_parts();
        debug!(url = %meta.url, len = body.len(), "cache entry committed");
        self.put(meta, body);
    }

    fn remove(&self, url: &Url) -> bool {
        self.entries.borrow_mut().remove(url.as_str()).is_some()
    }

    fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RawHeaders, ReplyAttributes};

    #[test]
    fn test_prepare_insert_remove() {
        let cache = MemoryCache::new();
        let url = Url::parse("http://example.com/a").unwrap();
        let meta = CacheMetaData::from_response(url.clone(), RawHeaders::new(), ReplyAttributes::default());
        let mut writer = cache.prepare(meta).unwrap();
        writer.write(b"hello ");
        writer.write(b"world");
        assert!(cache.data(&url).is_none());
        cache.insert(writer);
        assert_eq!(cache.data(&url).as_deref(), Some(&b"hello world"[..]));
        assert_eq!(cache.meta_data(&url).unwrap().url, url);
        assert!(cache.remove(&url));
        assert!(!cache.remove(&url));
    }
}
