#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use tether::effects::{Capabilities, IoFeatures, SecurityFeature};
use tether::{
    Backend, BackendContext, BackendFactory, BackendRegistry, ErrorKind, EventLoop, KnownHeader,
    Manager, ManagerConfig, Operation, Reply, ReplyEvent, Request,
};
use url::Url;

/// What a scripted backend does once opened.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub redirect: Option<(String, u16)>,
    pub auth_realm: Option<String>,
    pub error: Option<(ErrorKind, String)>,
    /// Never report `finished`.
    pub hang: bool,
}

impl Script {
    pub fn body(body: &[u8]) -> Self {
        Self {
            status: Some(200),
            body: body.to_vec(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn redirect(target: &str, status: u16) -> Self {
        Self {
            status: Some(status),
            redirect: Some((target.to_owned(), status)),
            ..Self::default()
        }
        .header("Location", target)
    }
}

/// A request as a backend saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub operation: Operation,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub upload: Vec<u8>,
}

impl Seen {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type ScriptFn = fn(Operation, &Request) -> Script;

pub struct MockFactory {
    schemes: Vec<String>,
    capabilities: Capabilities,
    script: ScriptFn,
    pub opened: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl MockFactory {
    pub fn new(schemes: &[&str], capabilities: Capabilities, script: ScriptFn) -> Self {
        Self {
            schemes: schemes.iter().map(|s| s.to_string()).collect(),
            capabilities,
            script,
            opened: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn networked(schemes: &[&str], script: ScriptFn) -> Self {
        Self::new(
            schemes,
            Capabilities::networked(SecurityFeature::None, IoFeatures::NEEDS_RESETTABLE_UPLOAD),
            script,
        )
    }

    /// Networked backend that hands out its body through the read pointer.
    pub fn zero_copy(schemes: &[&str], script: ScriptFn) -> Self {
        Self::new(
            schemes,
            Capabilities::networked(SecurityFeature::None, IoFeatures::ZERO_COPY),
            script,
        )
    }

    pub fn local(schemes: &[&str], script: ScriptFn) -> Self {
        Self::new(
            schemes,
            Capabilities::local(IoFeatures::SUPPORTS_SYNCHRONOUS),
            script,
        )
    }
}

impl BackendFactory for MockFactory {
    fn supported_schemes(&self) -> Vec<String> {
        self.schemes.clone()
    }

    fn create(&self, operation: Operation, request: &Request) -> Option<Box<dyn Backend>> {
        if !self.schemes.iter().any(|s| s == request.url().scheme()) {
            return None;
        }
        Some(Box::new(MockBackend {
            operation,
            capabilities: self.capabilities,
            script: (self.script)(operation, request),
            opened: self.opened.clone(),
            seen: self.seen.clone(),
            body: Bytes::new(),
        }))
    }
}

struct MockBackend {
    operation: Operation,
    capabilities: Capabilities,
    script: Script,
    opened: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
    body: Bytes,
}

impl Backend for MockBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open(&mut self, ctx: BackendContext) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let request = ctx.request().unwrap();
        let mut upload = Vec::new();
        if let Some(mut device) = ctx.create_upload_device() {
            loop {
                let chunk = device.read_pointer(1024).unwrap();
                if chunk.is_empty() {
                    break;
                }
                let n = chunk.len();
                upload.extend_from_slice(chunk);
                device.advance_read_pointer(n);
            }
        }
        self.seen.lock().unwrap().push(Seen {
            operation: self.operation,
            url: request.url().clone(),
            headers: request.headers().to_vec(),
            upload,
        });

        let script = self.script.clone();
        if let Some(realm) = script.auth_realm {
            ctx.authentication_required(realm);
            return;
        }
        ctx.update_attributes(|attrs| attrs.http_status = script.status);
        for (name, value) in &script.headers {
            ctx.append_raw_header(name.clone(), value.clone());
        }
        if let Some((target, status)) = script.redirect {
            let target = request.url().join(&target).unwrap();
            ctx.redirection_requested(target, status);
        }
        ctx.set_header(KnownHeader::ContentLength, script.body.len().to_string());
        ctx.meta_data_changed();
        if !script.body.is_empty() {
            self.body = Bytes::from(script.body);
            ctx.ready_read();
        }
        if let Some((kind, message)) = script.error {
            ctx.error(kind, message);
        }
        if !script.hang {
            ctx.finished();
        }
    }

    fn close(&mut self) {
        self.body = Bytes::new();
    }

    fn bytes_available(&self) -> u64 {
        self.body.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.body.len().min(buf.len());
        buf[..n].copy_from_slice(&self.body[..n]);
        self.body.advance(n);
        n
    }

    fn read_pointer(&self) -> &[u8] {
        &self.body
    }

    fn advance_read_pointer(&mut self, amount: usize) {
        self.body.advance(amount.min(self.body.len()));
    }
}

pub fn manager_with(event_loop: &EventLoop, config: ManagerConfig, factories: Vec<MockFactory>) -> Manager {
    let registry = BackendRegistry::new();
    for factory in factories {
        registry.register(Arc::new(factory));
    }
    Manager::with_registry(event_loop, config, Arc::new(registry))
}

/// Records every event a reply emits.
pub fn record(reply: &Reply) -> Rc<RefCell<Vec<ReplyEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    reply.connect(move |_, event| sink.borrow_mut().push(event.clone()));
    events
}

pub fn count(events: &[ReplyEvent], pred: impl Fn(&ReplyEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

pub fn request(url: &str) -> Request {
    Request::parse(url).unwrap()
}
