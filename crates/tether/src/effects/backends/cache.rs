use std::rc::Rc;

use bytes::{Buf, Bytes};
use tracing::debug;

use crate::data::Operation;
use crate::effects::backend::{Backend, Capabilities, IoFeatures};
use crate::effects::cache_store::CacheStore;
use crate::effects::reply::BackendContext;
use crate::error::ErrorKind;

/// Replays a stored response. The body is handed out through the read
/// pointer without copying.
pub struct CacheBackend {
    store: Option<Rc<dyn CacheStore>>,
    body: Bytes,
}

impl CacheBackend {
    /// Without a store every lookup misses.
    pub fn new(store: Option<Rc<dyn CacheStore>>) -> Self {
        Self {
            store,
            body: Bytes::new(),
        }
    }
}

impl Backend for CacheBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::local(IoFeatures::ZERO_COPY | IoFeatures::SUPPORTS_SYNCHRONOUS)
    }

    fn open(&mut self, ctx: BackendContext) {
        let Some(url) = ctx.url() else {
            return;
        };
        let hit = self
            .store
            .as_ref()
            .and_then(|store| Some((store.meta_data(&url)?, store.data(&url)?)));
        let Some((meta, body)) = hit else {
            debug!(%url, "cache miss");
            ctx.error(ErrorKind::ContentNotFound, "Item not found in cache");
            ctx.finished();
            return;
        };
        debug!(%url, len = body.len(), "serving from cache");
        for (name, value) in meta.headers.iter() {
            ctx.append_raw_header(name, value);
        }
        ctx.update_attributes(|attrs| {
            *attrs = meta.attributes.clone();
            attrs.source_is_from_cache = true;
        });
        ctx.meta_data_changed();
        if ctx.operation() != Some(Operation::Head) && !body.is_empty() {
            self.body = body;
            ctx.ready_read();
        }
        ctx.finished();
    }

    fn close(&mut self) {
        self.body = Bytes::new();
    }

    fn bytes_available(&self) -> u64 {
        self.body.len() as u64
    }

    fn read_pointer(&self) -> &[u8] {
        &self.body
    }

    fn advance_read_pointer(&mut self, amount: usize) {
        self.body.advance(amount.min(self.body.len()));
    }
}
