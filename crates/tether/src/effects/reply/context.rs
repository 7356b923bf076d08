use std::fmt;
use std::rc::{Rc, Weak};

use tether_buffer::{LocalWaker, ProgressDevice, RingBufferDevice, SourceDevice, UploadDevice};
use tracing::trace;
use url::Url;

use super::{Notification, ReplyInner, Upload};
use crate::data::{KnownHeader, Operation, ReplyAttributes, Request};
use crate::effects::access_cache::{AccessCache, PooledObject};
use crate::effects::runtime::{EventLoop, RemoteWaker};
use crate::error::ErrorKind;

/// A backend's handle on the reply it serves.
///
/// Reports are queued and processed on a later loop iteration; they never
/// call back into the backend. Once the reply has moved on (finished,
/// aborted, or restarted for a redirect) the context goes stale and every
/// report is dropped.
#[derive(Clone)]
pub struct BackendContext {
    reply: Weak<ReplyInner>,
    generation: u64,
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}

impl BackendContext {
    pub(super) fn new(reply: Weak<ReplyInner>, generation: u64) -> Self {
        Self { reply, generation }
    }

    fn live(&self) -> Option<Rc<ReplyInner>> {
        let reply = self.reply.upgrade()?;
        if reply.generation.get() != self.generation {
            return None;
        }
        Some(reply)
    }

    fn notify(&self, notification: Notification) {
        if let Some(reply) = self.live() {
            reply.push_notification(notification);
        }
    }

    pub fn is_live(&self) -> bool {
        self.live().is_some_and(|r| !r.is_terminal())
    }

    pub fn url(&self) -> Option<Url> {
        self.live().map(|r| r.request.borrow().url().clone())
    }

    pub fn operation(&self) -> Option<Operation> {
        self.live().map(|r| r.core.borrow().operation)
    }

    pub fn request(&self) -> Option<Request> {
        self.live().map(|r| r.request.borrow().clone())
    }

    pub fn is_synchronous(&self) -> bool {
        self.live().is_some_and(|r| r.core.borrow().synchronous)
    }

    /// New bytes are available through [`Backend::read`](crate::effects::Backend::read)
    /// or the read pointer.
    pub fn ready_read(&self) {
        self.notify(Notification::DownstreamReadyWrite);
    }

    pub fn finished(&self) {
        self.notify(Notification::Finished);
    }

    /// Record an error. Only the first error of a reply is kept; the backend
    /// is still expected to call [`finished`](Self::finished).
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        let Some(reply) = self.live() else {
            return;
        };
        if reply.is_terminal() {
            return;
        }
        reply.set_error(kind, message);
        reply.push_notification(Notification::Error);
    }

    pub fn meta_data_changed(&self) {
        self.notify(Notification::MetaDataChanged);
    }

    pub fn set_raw_header(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Some(reply) = self.live() {
            reply.core.borrow_mut().headers.set(name, value);
        }
    }

    pub fn append_raw_header(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Some(reply) = self.live() {
            reply.core.borrow_mut().headers.append(name, value);
        }
    }

    pub fn set_header(&self, header: KnownHeader, value: impl Into<String>) {
        self.set_raw_header(header.name(), value);
    }

    pub fn update_attributes(&self, update: impl FnOnce(&mut ReplyAttributes)) {
        if let Some(reply) = self.live() {
            update(&mut reply.core.borrow_mut().attributes);
        }
    }

    pub fn redirection_requested(&self, target: Url, status: u16) {
        self.notify(Notification::Redirect { target, status });
    }

    pub fn authentication_required(&self, realm: impl Into<String>) {
        self.notify(Notification::Authentication {
            proxy: false,
            realm: realm.into(),
        });
    }

    pub fn proxy_authentication_required(&self, realm: impl Into<String>) {
        self.notify(Notification::Authentication {
            proxy: true,
            realm: realm.into(),
        });
    }

    /// The request body as a device, or `None` when there is none.
    ///
    /// Advancing the device reports upload progress to the reply.
    pub fn create_upload_device(&self) -> Option<Box<dyn UploadDevice>> {
        let reply = self.live()?;
        let (upload, synchronous) = {
            let core = reply.core.borrow();
            (core.upload.clone(), core.synchronous)
        };
        let device: Box<dyn UploadDevice> = match upload {
            Upload::None => return None,
            Upload::Source(source) => {
                Box::new(SourceDevice::new(source, reply.settings.chunk_size))
            }
            Upload::Buffered(buffer) => Box::new(RingBufferDevice::new(buffer)),
        };
        if synchronous {
            return Some(device);
        }
        let weak = Rc::downgrade(&reply);
        let generation = self.generation;
        Some(Box::new(ProgressDevice::new(device, move |sent, total| {
            if let Some(reply) = weak.upgrade() {
                if reply.generation.get() == generation {
                    reply.on_upload_progress(sent, total);
                }
            }
        })))
    }

    /// The manager's pool for reusable connections.
    pub fn connection_cache(&self) -> Option<AccessCache<PooledObject>> {
        let reply = self.live()?;
        reply.manager().map(|m| m.connections())
    }

    pub fn event_loop(&self) -> Option<EventLoop> {
        self.live().map(|r| r.event_loop.clone())
    }

    /// A waker that may be sent to other threads. Waking it schedules
    /// [`Backend::wake`](crate::effects::Backend::wake) on the reply's loop.
    /// It stops working when this context goes stale.
    pub fn remote_waker(&self) -> Option<RemoteWaker> {
        let reply = self.live()?;
        let weak = Rc::downgrade(&reply);
        let generation = self.generation;
        let registration = reply.event_loop.remote_waker(move || {
            if let Some(reply) = weak.upgrade() {
                reply.wake_backend(generation);
            }
        });
        let waker = registration.waker();
        reply.core.borrow_mut().wakers.push(registration);
        Some(waker)
    }

    /// A same-thread waker, suitable for upload devices.
    pub fn local_waker(&self) -> LocalWaker {
        let weak = self.reply.clone();
        let generation = self.generation;
        Rc::new(move || {
            let Some(reply) = weak.upgrade() else {
                return;
            };
            trace!(reply = reply.id, "local wake");
            let weak = weak.clone();
            reply.event_loop.post(move || {
                if let Some(reply) = weak.upgrade() {
                    reply.wake_backend(generation);
                }
            });
        })
    }
}
