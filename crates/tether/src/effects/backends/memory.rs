use bytes::{Buf, Bytes};
use tracing::debug;

use crate::core::decode_data_url;
use crate::data::{KnownHeader, Operation};
use crate::effects::backend::{Backend, Capabilities, IoFeatures};
use crate::effects::reply::BackendContext;
use crate::error::ErrorKind;

/// Hands an in-memory body to the reply in one go.
#[derive(Debug, Default)]
struct Body {
    data: Bytes,
}

impl Body {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.data.len().min(buf.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        n
    }

    fn deliver(&mut self, ctx: &BackendContext, data: Bytes, media_type: Option<&str>) {
        if let Some(media_type) = media_type {
            ctx.set_header(KnownHeader::ContentType, media_type);
        }
        ctx.set_header(KnownHeader::ContentLength, data.len().to_string());
        ctx.meta_data_changed();
        if ctx.operation() != Some(Operation::Head) {
            self.data = data;
            if !self.data.is_empty() {
                ctx.ready_read();
            }
        }
        ctx.finished();
    }
}

fn local_capabilities() -> Capabilities {
    Capabilities::local(IoFeatures::SUPPORTS_SYNCHRONOUS)
}

/// Serves `data:` URLs.
#[derive(Debug, Default)]
pub struct DataBackend {
    body: Body,
}

impl DataBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for DataBackend {
    fn capabilities(&self) -> Capabilities {
        local_capabilities()
    }

    fn open(&mut self, ctx: BackendContext) {
        let Some(url) = ctx.url() else {
            return;
        };
        match decode_data_url(&url) {
            Some(decoded) => {
                debug!(len = decoded.body.len(), media_type = %decoded.media_type, "data url decoded");
                self.body
                    .deliver(&ctx, decoded.body, Some(decoded.media_type.as_str()));
            }
            None => {
                ctx.error(
                    ErrorKind::ProtocolInvalidOperation,
                    format!("Invalid URI: {url}"),
                );
                ctx.finished();
            }
        }
    }

    fn close(&mut self) {
        self.body.data.clear();
    }

    fn bytes_available(&self) -> u64 {
        self.body.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.body.read(buf)
    }
}

/// Serves a resource registered with the manager; `None` means it was
/// not found.
#[derive(Debug)]
pub struct ResourceBackend {
    resource: Option<Bytes>,
    body: Body,
}

impl ResourceBackend {
    pub fn new(resource: Option<Bytes>) -> Self {
        Self {
            resource,
            body: Body::default(),
        }
    }
}

impl Backend for ResourceBackend {
    fn capabilities(&self) -> Capabilities {
        local_capabilities()
    }

    fn open(&mut self, ctx: BackendContext) {
        match self.resource.take() {
            Some(data) => self.body.deliver(&ctx, data, None),
            None => {
                let url = ctx.url().map(|u| u.to_string()).unwrap_or_default();
                ctx.error(
                    ErrorKind::ContentNotFound,
                    format!("Error opening {url}: not found"),
                );
                ctx.finished();
            }
        }
    }

    fn close(&mut self) {
        self.body.data.clear();
    }

    fn bytes_available(&self) -> u64 {
        self.body.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.body.read(buf)
    }
}
