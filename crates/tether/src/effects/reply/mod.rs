//! The per-request reply: a readable byte stream with lifecycle events.
//!
//! A reply moves through `Idle → Buffering → Working → Finished | Aborted`.
//! Backends report through a [`BackendContext`]; their reports are queued
//! and handled on the next loop iteration, so neither side ever re-enters
//! the other. Listeners run with no internal borrow held and may call any
//! method on the reply, including [`Reply::abort`].

mod context;
mod machine;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tether_buffer::{ByteRingBuffer, SharedSource};
use tracing::warn;
use url::Url;

pub use context::BackendContext;

use super::backend::{Backend, SecurityFeature};
use super::manager::ManagerShared;
use super::runtime::{EventLoop, TimerId, WakeRegistration};
use crate::core::ProgressChoke;
use crate::data::{
    CacheWriter, Credentials, KnownHeader, Operation, Proxy, RawHeaders, RedirectPolicy,
    ReplyAttributes, Request, SslConfiguration,
};
use crate::error::ReplyError;

pub type Listener = Rc<dyn Fn(&Reply, &ReplyEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Idle,
    /// Staging a sequential upload before the backend opens.
    Buffering,
    Working,
    Finished,
    Aborted,
}

impl ReplyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplyState::Finished | ReplyState::Aborted)
    }
}

/// Signals delivered to listeners, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    MetaDataChanged,
    /// New bytes can be read.
    ReadyRead,
    DownloadProgress { received: u64, total: Option<u64> },
    UploadProgress { sent: u64, total: Option<u64> },
    /// A redirect waits for [`Reply::follow_redirect`].
    RedirectPending(Url),
    Redirected(Url),
    Error(ReplyError),
    ReadChannelFinished,
    /// Always the last event of a transfer.
    Finished,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notification {
    DownstreamReadyWrite,
    MetaDataChanged,
    UploadProgress,
    Error,
    Finished,
    Redirect { target: Url, status: u16 },
    Authentication { proxy: bool, realm: String },
}

impl Notification {
    fn is_coalesced(&self) -> bool {
        !matches!(
            self,
            Notification::Redirect { .. } | Notification::Authentication { .. }
        )
    }
}

#[derive(Clone)]
pub(crate) enum Upload {
    None,
    Source(SharedSource),
    Buffered(Rc<ByteRingBuffer>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplySettings {
    pub progress_interval: Duration,
    pub downstream_block_size: usize,
    pub chunk_size: usize,
}

/// Everything the manager resolves before handing a request to a reply.
pub(crate) struct ReplyOptions {
    pub id: u64,
    pub event_loop: EventLoop,
    pub manager: Weak<ManagerShared>,
    pub settings: ReplySettings,
    pub operation: Operation,
    pub request: Request,
    pub upload: Option<SharedSource>,
    pub backend: Option<Box<dyn Backend>>,
    pub read_buffer_size: usize,
    pub max_redirects: u32,
    pub redirect_policy: RedirectPolicy,
    pub transfer_timeout: Option<Duration>,
    pub auto_delete: bool,
}

pub(crate) struct ReplyCore {
    state: ReplyState,
    operation: Operation,
    error: Option<ReplyError>,
    error_emitted: bool,
    finishing: bool,
    disposed: bool,
    open: bool,
    synchronous: bool,
    sync_draining: bool,
    zero_copy: bool,
    networked: bool,

    headers: RawHeaders,
    attributes: ReplyAttributes,

    read_buffer: ByteRingBuffer,
    read_buffer_max: usize,
    downloaded: u64,
    zero_copy_pending: u64,
    download_choke: ProgressChoke,

    upload: Upload,
    staging: ByteRingBuffer,
    buffering_waker: bool,
    uploaded: u64,
    upload_total: Option<u64>,
    upload_choke: ProgressChoke,

    notifications: VecDeque<Notification>,
    notify_posted: bool,

    redirect_policy: RedirectPolicy,
    redirects_left: u32,
    pending_redirect: Option<(Url, u16)>,

    auth_attempts: u32,
    proxy_auth_attempts: u32,
    last_credentials: Option<Credentials>,
    last_proxy_credentials: Option<Credentials>,
    current_proxy: Option<Proxy>,

    ssl: Option<SslConfiguration>,
    ignore_ssl_errors: bool,

    cache_writer: Option<CacheWriter>,
    cache_prepared: bool,

    transfer_timeout: Option<Duration>,
    transfer_timer: Option<TimerId>,
    wakers: Vec<WakeRegistration>,
    auto_delete: bool,
}

pub(crate) struct ReplyInner {
    id: u64,
    event_loop: EventLoop,
    manager: Weak<ManagerShared>,
    settings: ReplySettings,
    request: RefCell<Request>,
    core: RefCell<ReplyCore>,
    backend: RefCell<Option<Box<dyn Backend>>>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
    next_listener: Cell<u64>,
    generation: Cell<u64>,
}

/// Handle to a running or finished request. Clones refer to the same reply.
#[derive(Clone)]
pub struct Reply {
    inner: Rc<ReplyInner>,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("id", &self.inner.id)
            .field("url", &self.inner.request.borrow().url().as_str())
            .field("state", &self.inner.core.borrow().state)
            .finish()
    }
}

impl PartialEq for Reply {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Reply {}

impl Reply {
    pub(crate) fn create(options: ReplyOptions) -> Self {
        let request = options.request;
        let attrs = request.attributes();
        let upload_choke = if attrs.emit_all_upload_progress {
            ProgressChoke::unconditional()
        } else {
            ProgressChoke::new(options.settings.progress_interval)
        };
        let (upload, upload_total) = match options.upload {
            Some(source) => {
                let size = source.borrow().size().or_else(|| request.headers().content_length());
                (Upload::Source(source), size)
            }
            None => (Upload::None, None),
        };
        let chunk_size = options.settings.chunk_size;
        let core = ReplyCore {
            state: ReplyState::Idle,
            operation: options.operation,
            error: None,
            error_emitted: false,
            finishing: false,
            disposed: false,
            open: false,
            synchronous: false,
            sync_draining: false,
            zero_copy: false,
            networked: false,
            headers: RawHeaders::new(),
            attributes: ReplyAttributes::default(),
            read_buffer: ByteRingBuffer::with_chunk_size(chunk_size),
            read_buffer_max: options.read_buffer_size,
            downloaded: 0,
            zero_copy_pending: 0,
            download_choke: ProgressChoke::new(options.settings.progress_interval),
            upload,
            staging: ByteRingBuffer::with_chunk_size(chunk_size),
            buffering_waker: false,
            uploaded: 0,
            upload_total,
            upload_choke,
            notifications: VecDeque::new(),
            notify_posted: false,
            redirect_policy: options.redirect_policy,
            redirects_left: options.max_redirects,
            pending_redirect: None,
            auth_attempts: 0,
            proxy_auth_attempts: 0,
            last_credentials: None,
            last_proxy_credentials: None,
            current_proxy: None,
            ssl: None,
            ignore_ssl_errors: false,
            cache_writer: None,
            cache_prepared: false,
            transfer_timeout: options.transfer_timeout,
            transfer_timer: None,
            wakers: Vec::new(),
            auto_delete: options.auto_delete,
        };
        Self {
            inner: Rc::new(ReplyInner {
                id: options.id,
                event_loop: options.event_loop,
                manager: options.manager,
                settings: options.settings,
                request: RefCell::new(request),
                core: RefCell::new(core),
                backend: RefCell::new(options.backend),
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
                generation: Cell::new(0),
            }),
        }
    }

    pub(crate) fn setup(&self) {
        self.inner.setup();
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn auto_delete(&self) -> bool {
        self.inner.core.borrow().auto_delete
    }

    /// The request as currently sent; redirects update its URL.
    pub fn request(&self) -> Request {
        self.inner.request.borrow().clone()
    }

    pub fn url(&self) -> Url {
        self.inner.request.borrow().url().clone()
    }

    pub fn operation(&self) -> Operation {
        self.inner.core.borrow().operation
    }

    pub fn error(&self) -> Option<ReplyError> {
        self.inner.core.borrow().error.clone()
    }

    pub fn state(&self) -> ReplyState {
        self.inner.core.borrow().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ReplyState::Buffering | ReplyState::Working)
    }

    /// Readable; true from creation until closed or aborted.
    pub fn is_open(&self) -> bool {
        self.inner.core.borrow().open
    }

    pub fn raw_header(&self, name: &str) -> Option<String> {
        self.inner.core.borrow().headers.get(name).map(str::to_owned)
    }

    pub fn raw_header_list(&self) -> Vec<(String, String)> {
        self.inner.core.borrow().headers.to_vec()
    }

    pub fn header(&self, header: KnownHeader) -> Option<String> {
        self.raw_header(header.name())
    }

    pub fn attributes(&self) -> ReplyAttributes {
        self.inner.core.borrow().attributes.clone()
    }

    pub fn bytes_available(&self) -> u64 {
        let core = self.inner.core.borrow();
        core.read_buffer.len() as u64 + core.zero_copy_pending
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        if !self.is_open() {
            return 0;
        }
        let mut n = self.inner.core.borrow_mut().read_buffer.read(buf);
        if n < buf.len() && self.inner.core.borrow().zero_copy {
            n += self.inner.read_zero_copy(&mut buf[n..]);
        }
        if n > 0 {
            self.inner.after_caller_read();
        }
        n
    }

    pub fn read_all(&self) -> Bytes {
        if !self.is_open() {
            return Bytes::new();
        }
        self.inner.materialize();
        let data = self.inner.core.borrow_mut().read_buffer.read_all();
        if !data.is_empty() {
            self.inner.after_caller_read();
        }
        data
    }

    /// Copy buffered bytes without consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        if !self.is_open() {
            return 0;
        }
        self.inner.materialize();
        self.inner.core.borrow().read_buffer.peek(buf, 0)
    }

    pub fn can_read_line(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.inner.materialize();
        self.inner.core.borrow().read_buffer.can_read_line()
    }

    /// One line including its `\n`, at most `max_len` bytes.
    pub fn read_line(&self, max_len: usize) -> Bytes {
        if !self.is_open() {
            return Bytes::new();
        }
        self.inner.materialize();
        let line = self.inner.core.borrow_mut().read_buffer.read_line(max_len);
        if !line.is_empty() {
            self.inner.after_caller_read();
        }
        line
    }

    /// How far ahead of the caller the reply may buffer; 0 is unbounded.
    pub fn read_buffer_size(&self) -> usize {
        self.inner.core.borrow().read_buffer_max
    }

    pub fn set_read_buffer_size(&self, size: usize) {
        let working = {
            let mut core = self.inner.core.borrow_mut();
            core.read_buffer_max = size;
            core.state == ReplyState::Working
        };
        if working {
            self.inner
                .push_notification(Notification::DownstreamReadyWrite);
        }
    }

    /// Cancel the transfer. Emits `Error(OperationCanceled)` and `Finished`
    /// unless the reply already finished; calling it again does nothing.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Abort a running reply; on a finished one, release the data.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn ignore_ssl_errors(&self) {
        self.inner.core.borrow_mut().ignore_ssl_errors = true;
        if let Some(backend) = self.inner.backend.borrow_mut().as_mut() {
            backend.ignore_ssl_errors();
        }
    }

    pub fn ssl_configuration(&self) -> Option<SslConfiguration> {
        {
            let backend = self.inner.backend.borrow();
            if let Some(backend) = backend.as_ref() {
                if backend.capabilities().security == SecurityFeature::Tls {
                    return backend.ssl_configuration();
                }
            }
        }
        let ssl = self.inner.core.borrow().ssl.clone();
        ssl.or_else(|| self.inner.request.borrow().ssl_configuration().cloned())
    }

    pub fn set_ssl_configuration(&self, config: SslConfiguration) {
        if let Some(backend) = self.inner.backend.borrow_mut().as_mut() {
            backend.set_ssl_configuration(&config);
        }
        self.inner.core.borrow_mut().ssl = Some(config);
    }

    /// Continue a redirect held back by `RedirectPolicy::UserVerified`.
    pub fn follow_redirect(&self) {
        let pending = self.inner.core.borrow_mut().pending_redirect.take();
        match pending {
            Some((target, status)) => self.inner.follow(target, status),
            None => warn!(reply = self.inner.id, "follow_redirect without a pending redirect"),
        }
    }

    pub fn connect(&self, listener: impl Fn(&Reply, &ReplyEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.get());
        self.inner.next_listener.set(id.0 + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        id
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        before != listeners.len()
    }

    /// Abort if needed, emit `Destroyed`, and drop listeners and backend.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}
