//! HTTP(S) over reqwest.
//!
//! The transfer runs as a task on the ambient tokio runtime and reports
//! back through a channel plus a remote waker; everything that touches
//! the reply happens in [`Backend::wake`] on the reply's loop.

use std::rc::Rc;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use tether_buffer::{ByteRingBuffer, UploadDevice};
use tether_cache::Cacheable;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::{error_for_status, is_redirect};
use crate::data::{
    KnownHeader, Operation, Proxy, Request, SslConfiguration, realm_from_challenge,
};
use crate::effects::access_cache::{AccessCache, PooledObject};
use crate::effects::backend::{Backend, BackendFactory, Capabilities, IoFeatures, SecurityFeature};
use crate::effects::reply::BackendContext;
use crate::effects::runtime::RemoteWaker;
use crate::error::ErrorKind;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// A configured client in the manager's connection cache. reqwest pools
/// the sockets behind it, so it is shared between replies.
#[derive(Debug, Clone)]
struct PooledClient(reqwest::Client);

impl Cacheable for PooledClient {
    fn is_shareable(&self) -> bool {
        true
    }
}

enum Message {
    Head {
        status: u16,
        reason: Option<String>,
        headers: Vec<(String, String)>,
    },
    Body(Bytes),
    Failed(ErrorKind, String),
    Done,
}

pub struct HttpBackend {
    operation: Operation,
    ctx: Option<BackendContext>,
    proxies: Vec<Proxy>,
    ssl: Option<SslConfiguration>,
    ignore_ssl_errors: bool,
    upload: Option<Box<dyn UploadDevice>>,
    upload_body: Vec<u8>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    task: Option<JoinHandle<()>>,
    pool: Option<(AccessCache<PooledObject>, Bytes)>,
    buffer: ByteRingBuffer,
    status_error: Option<(ErrorKind, String)>,
}

impl HttpBackend {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            ctx: None,
            proxies: vec![Proxy::NoProxy],
            ssl: None,
            ignore_ssl_errors: false,
            upload: None,
            upload_body: Vec::new(),
            rx: None,
            task: None,
            pool: None,
            buffer: ByteRingBuffer::new(),
            status_error: None,
        }
    }

    fn proxy(&self) -> Proxy {
        self.proxies.first().cloned().unwrap_or(Proxy::NoProxy)
    }

    fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if let Some(ctx) = &self.ctx {
            ctx.error(kind, message);
            ctx.finished();
        }
        self.rx = None;
    }

    /// Collect the upload in full; returns `false` while it is pending.
    fn collect_upload(&mut self) -> bool {
        let Some(device) = self.upload.as_mut() else {
            return true;
        };
        loop {
            let chunk = match device.read_pointer(UPLOAD_CHUNK) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.upload = None;
                    self.fail(ErrorKind::UnknownContent, format!("Upload failed: {e}"));
                    return false;
                }
            };
            if chunk.is_empty() {
                if device.at_end() {
                    break;
                }
                trace!(collected = self.upload_body.len(), "upload pending");
                return false;
            }
            let n = chunk.len();
            self.upload_body.extend_from_slice(chunk);
            device.advance_read_pointer(n);
        }
        device.set_waker(None);
        self.upload = None;
        true
    }

    fn pool_key(request: &Request, proxy: &Proxy, ssl: Option<&SslConfiguration>, ignore: bool) -> Bytes {
        let url = request.url();
        let key = format!(
            "http:{}://{}:{}|{:?}|{:?}|{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default(),
            proxy.url().map(|u| u.as_str()),
            ssl,
            ignore,
        );
        Bytes::from(key)
    }

    fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        builder = match self.proxy() {
            Proxy::NoProxy => builder.no_proxy(),
            Proxy::Http(url) => builder.proxy(reqwest::Proxy::all(url.as_str())?),
        };
        let mut accept_invalid = self.ignore_ssl_errors;
        if let Some(ssl) = &self.ssl {
            for pem in &ssl.root_certificates {
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
            }
            accept_invalid |= ssl.accept_invalid_certificates;
        }
        if accept_invalid {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build()
    }

    /// Reuse a pooled client for the same origin and settings, or build
    /// and pool a new one.
    fn client(&mut self, ctx: &BackendContext, request: &Request) -> reqwest::Result<reqwest::Client> {
        let key = Self::pool_key(request, &self.proxy(), self.ssl.as_ref(), self.ignore_ssl_errors);
        let Some(pool) = ctx.connection_cache() else {
            return self.build_client();
        };
        let pooled = pool
            .request_entry_now(&key)
            .and_then(|object| object.downcast_ref::<PooledClient>().map(|c| c.0.clone()));
        let client = match pooled {
            Some(client) => {
                trace!(key = ?key, "reusing pooled client");
                client
            }
            None => {
                let client = self.build_client()?;
                pool.add_entry(key.clone(), Rc::new(PooledClient(client.clone())), None);
                client
            }
        };
        self.pool = Some((pool, key));
        Ok(client)
    }

    fn send(&mut self) {
        let Some(ctx) = self.ctx.clone() else {
            return;
        };
        let Some(request) = ctx.request() else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(ErrorKind::UnknownNetwork, format!("No async runtime: {e}"));
                return;
            }
        };
        let verb = match self.operation {
            Operation::Custom => request.attributes().custom_verb.clone().unwrap_or_default(),
            op => op.method().unwrap_or_default().to_owned(),
        };
        let Ok(method) = Method::from_bytes(verb.as_bytes()) else {
            self.fail(ErrorKind::ProtocolInvalidOperation, format!("Invalid verb {verb:?}"));
            return;
        };
        let client = match self.client(&ctx, &request) {
            Ok(client) => client,
            Err(e) => {
                self.fail(map_error(&e), e.to_string());
                return;
            }
        };
        let Some(waker) = ctx.remote_waker() else {
            return;
        };

        let mut builder = client.request(method, request.url().as_str());
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if self.operation.has_body() || !self.upload_body.is_empty() {
            builder = builder.body(std::mem::take(&mut self.upload_body));
        }

        debug!(url = %request.url(), verb = %verb, "sending http request");
        let (tx, rx) = mpsc::unbounded_channel();
        self.rx = Some(rx);
        self.task = Some(handle.spawn(transfer(builder, tx, waker)));
    }

    fn handle_head(&mut self, ctx: &BackendContext, status: u16, reason: Option<String>, headers: Vec<(String, String)>) -> bool {
        let url = ctx.url();
        let encrypted = url.as_ref().is_some_and(|u| u.scheme() == "https");
        ctx.update_attributes(|attrs| {
            attrs.http_status = Some(status);
            attrs.reason_phrase = reason.clone();
            attrs.connection_encrypted = encrypted;
        });
        let mut location = None;
        let mut challenge = None;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(KnownHeader::Location.name()) {
                location = Some(value.clone());
            }
            if (status == 401 && name.eq_ignore_ascii_case("WWW-Authenticate"))
                || (status == 407 && name.eq_ignore_ascii_case("Proxy-Authenticate"))
            {
                challenge.get_or_insert_with(|| value.clone());
            }
            ctx.append_raw_header(name, value);
        }

        if status == 401 || status == 407 {
            let realm = challenge.as_deref().map(realm_from_challenge).unwrap_or_default();
            if status == 401 {
                ctx.authentication_required(realm);
            } else {
                ctx.proxy_authentication_required(realm);
            }
            return false;
        }

        if is_redirect(status) {
            let target = location
                .zip(url.as_ref())
                .and_then(|(location, base)| base.join(&location).ok());
            match target {
                Some(target) => ctx.redirection_requested(target, status),
                None => warn!(status, "redirect without a usable Location"),
            }
        }
        ctx.meta_data_changed();
        if let Some(kind) = error_for_status(status) {
            let url = url.map(|u| u.to_string()).unwrap_or_default();
            let reason = reason.unwrap_or_default();
            self.status_error = Some((
                kind,
                format!("Error transferring {url} - server replied: {reason}"),
            ));
        }
        true
    }
}

/// Runs on the tokio runtime; every message is followed by a wake.
async fn transfer(
    builder: reqwest::RequestBuilder,
    tx: mpsc::UnboundedSender<Message>,
    waker: RemoteWaker,
) {
    let post = |message: Message| {
        let sent = tx.send(message).is_ok();
        waker.wake();
        sent
    };
    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            post(Message::Failed(map_error(&e), e.to_string()));
            return;
        }
    };
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
        .collect();
    let status = response.status();
    let head = Message::Head {
        status: status.as_u16(),
        reason: status.canonical_reason().map(str::to_owned),
        headers,
    };
    if !post(head) {
        return;
    }
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) => {
                if !post(Message::Body(data)) {
                    return;
                }
            }
            Err(e) => {
                post(Message::Failed(map_error(&e), e.to_string()));
                return;
            }
        }
    }
    post(Message::Done);
}

fn map_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::ConnectionRefused
    } else if err.is_builder() {
        ErrorKind::ProtocolInvalidOperation
    } else {
        ErrorKind::UnknownNetwork
    }
}

impl Backend for HttpBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::networked(SecurityFeature::Tls, IoFeatures::NEEDS_RESETTABLE_UPLOAD)
    }

    fn open(&mut self, ctx: BackendContext) {
        if let Some(mut device) = ctx.create_upload_device() {
            device.set_waker(Some(ctx.local_waker()));
            self.upload = Some(device);
        }
        self.ctx = Some(ctx);
        if self.collect_upload() {
            self.send();
        }
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(device) = self.upload.as_mut() {
            device.set_waker(None);
        }
        self.upload = None;
        self.rx = None;
        if let Some((pool, key)) = self.pool.take() {
            pool.release_entry(&key);
        }
        self.ctx = None;
    }

    fn bytes_available(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.buffer.read(buf)
    }

    fn set_proxy_list(&mut self, proxies: Vec<Proxy>) {
        self.proxies = proxies;
    }

    fn set_ssl_configuration(&mut self, config: &SslConfiguration) {
        self.ssl = Some(config.clone());
    }

    fn ssl_configuration(&self) -> Option<SslConfiguration> {
        self.ssl.clone()
    }

    fn ignore_ssl_errors(&mut self) {
        self.ignore_ssl_errors = true;
    }

    fn wake(&mut self) {
        let Some(ctx) = self.ctx.clone() else {
            return;
        };
        if self.upload.is_some() {
            if self.collect_upload() {
                self.send();
            }
            return;
        }
        while let Some(message) = self.rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            match message {
                Message::Head {
                    status,
                    reason,
                    headers,
                } => {
                    trace!(status, "http head received");
                    if !self.handle_head(&ctx, status, reason, headers) {
                        self.rx = None;
                    }
                }
                Message::Body(data) => {
                    self.buffer.append_bytes(data);
                    ctx.ready_read();
                }
                Message::Failed(kind, message) => {
                    self.fail(kind, message);
                }
                Message::Done => {
                    if let Some((kind, message)) = self.status_error.take() {
                        ctx.error(kind, message);
                    }
                    ctx.finished();
                    self.rx = None;
                }
            }
        }
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if self.task.is_some() || self.pool.is_some() {
            self.close();
        }
    }
}

/// Serves `http` and `https`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpBackendFactory;

impl BackendFactory for HttpBackendFactory {
    fn supported_schemes(&self) -> Vec<String> {
        vec!["http".to_owned(), "https".to_owned()]
    }

    fn create(&self, operation: Operation, request: &Request) -> Option<Box<dyn Backend>> {
        let scheme = request.url().scheme();
        if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
            Some(Box::new(HttpBackend::new(operation)))
        } else {
            None
        }
    }
}
