//! Reply lifecycle: setup, buffering, the pull loop, redirects,
//! authentication retries and the finish sequence.

use std::mem;
use std::rc::Rc;
use std::time::SystemTime;

use bytes::Bytes;
use tether_buffer::{SharedSource, SourceRead};
use tracing::{debug, trace, warn};
use url::Url;

use super::context::BackendContext;
use super::{Listener, Notification, Reply, ReplyEvent, ReplyInner, ReplyState, Upload};
use crate::core::{CacheControl, Cookie, redirect_refusal, redirected_operation};
use crate::data::{
    AuthChallenge, CacheMetaData, CookieControl, CredentialKey, KnownHeader, Operation, Proxy,
    RedirectPolicy, ReplyAttributes,
};
use crate::effects::backend::{IoFeatures, SecurityFeature, TargetType};
use crate::effects::manager::ManagerShared;
use crate::error::{ErrorKind, ReplyError};

impl ReplyInner {
    pub(super) fn handle(self: &Rc<Self>) -> Reply {
        Reply {
            inner: self.clone(),
        }
    }

    pub(super) fn is_terminal(&self) -> bool {
        self.core.borrow().state.is_terminal()
    }

    pub(super) fn manager(&self) -> Option<Rc<ManagerShared>> {
        self.manager.upgrade()
    }

    fn set_state(&self, state: ReplyState) {
        let mut core = self.core.borrow_mut();
        debug!(reply = self.id, from = ?core.state, to = ?state, "reply state changed");
        core.state = state;
    }

    fn post_self(self: &Rc<Self>, task: impl FnOnce(&Rc<ReplyInner>) + 'static) {
        let weak = Rc::downgrade(self);
        self.event_loop.post(move || {
            if let Some(reply) = weak.upgrade() {
                task(&reply);
            }
        });
    }

    pub(super) fn emit(self: &Rc<Self>, event: ReplyEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let reply = self.handle();
        for listener in listeners {
            listener(&reply, &event);
        }
    }

    pub(super) fn push_notification(self: &Rc<Self>, notification: Notification) {
        let post = {
            let mut core = self.core.borrow_mut();
            if core.state.is_terminal() {
                return;
            }
            if notification.is_coalesced() && core.notifications.contains(&notification) {
                return;
            }
            core.notifications.push_back(notification);
            if core.notify_posted || core.sync_draining {
                false
            } else {
                core.notify_posted = true;
                true
            }
        };
        if post {
            self.post_self(|reply| reply.process_notifications());
        }
    }

    fn process_notifications(self: &Rc<Self>) {
        while let Some(notification) = self.next_notification() {
            self.handle_notification(notification);
        }
        self.core.borrow_mut().notify_posted = false;
    }

    fn next_notification(&self) -> Option<Notification> {
        let mut core = self.core.borrow_mut();
        if core.state.is_terminal() {
            core.notifications.clear();
            return None;
        }
        core.notifications.pop_front()
    }

    fn drain_sync(self: &Rc<Self>) {
        while let Some(notification) = self.next_notification() {
            self.handle_notification(notification);
        }
        self.core.borrow_mut().sync_draining = false;
    }

    fn handle_notification(self: &Rc<Self>, notification: Notification) {
        trace!(reply = self.id, ?notification, "handling notification");
        match notification {
            Notification::DownstreamReadyWrite => self.pull_downstream(),
            Notification::MetaDataChanged => self.on_meta_data_changed(),
            Notification::UploadProgress => self.emit_upload_progress(false),
            Notification::Error => self.emit_error(),
            Notification::Finished => self.finish(),
            Notification::Redirect { target, status } => self.on_redirect(target, status),
            Notification::Authentication { proxy, realm } => {
                self.on_authentication_required(proxy, realm)
            }
        }
    }

    // Setup and start.

    pub(super) fn setup(self: &Rc<Self>) {
        self.core.borrow_mut().open = true;
        let caps = self.backend.borrow().as_ref().map(|b| b.capabilities());
        let Some(caps) = caps else {
            let scheme = self.request.borrow().url().scheme().to_owned();
            debug!(reply = self.id, %scheme, "no backend for request");
            self.post_self(move |reply| {
                reply.fail(
                    ErrorKind::ProtocolUnknown,
                    format!("Protocol \"{scheme}\" is unknown"),
                )
            });
            return;
        };

        let (buffering, synchronous) = {
            let request = self.request.borrow();
            let attrs = request.attributes();
            let mut core = self.core.borrow_mut();
            core.synchronous =
                attrs.synchronous && caps.io.contains(IoFeatures::SUPPORTS_SYNCHRONOUS);
            let buffering = match &core.upload {
                Upload::Source(source) => {
                    let source = source.borrow();
                    source.is_sequential()
                        && request.headers().content_length().is_none()
                        && (caps.io.contains(IoFeatures::NEEDS_RESETTABLE_UPLOAD)
                            || attrs.do_not_buffer_upload)
                }
                _ => false,
            };
            (buffering, core.synchronous)
        };

        if buffering {
            self.set_state(ReplyState::Buffering);
            self.post_self(|reply| reply.buffer_upload());
        } else if synchronous {
            self.start();
        } else {
            self.post_self(|reply| reply.start());
        }
    }

    fn buffer_upload(self: &Rc<Self>) {
        let upload = self.core.borrow().upload.clone();
        let Upload::Source(source) = upload else {
            return;
        };
        let chunk = self.settings.chunk_size;
        loop {
            if self.core.borrow().state != ReplyState::Buffering {
                return;
            }
            let mut staging = mem::take(&mut self.core.borrow_mut().staging);
            let dst = staging.reserve(chunk);
            let result = source.borrow_mut().read(dst);
            let read = match result {
                Ok(SourceRead::Data(n)) => n.min(chunk),
                _ => 0,
            };
            staging.chop(chunk - read);
            self.core.borrow_mut().staging = staging;

            match result {
                Ok(SourceRead::Data(n)) if n > 0 => {}
                Ok(SourceRead::Data(_) | SourceRead::Pending) => {
                    self.install_buffering_waker(&source);
                    return;
                }
                Ok(SourceRead::Eof) => {
                    source.borrow_mut().set_waker(None);
                    {
                        let mut core = self.core.borrow_mut();
                        let staging = mem::take(&mut core.staging);
                        debug!(reply = self.id, len = staging.len(), "upload buffered");
                        core.upload_total = Some(staging.len() as u64);
                        core.upload = Upload::Buffered(Rc::new(staging));
                    }
                    self.start();
                    return;
                }
                Err(e) => {
                    source.borrow_mut().set_waker(None);
                    self.fail(ErrorKind::UnknownContent, format!("Upload source failed: {e}"));
                    return;
                }
            }
        }
    }

    fn install_buffering_waker(self: &Rc<Self>, source: &SharedSource) {
        if mem::replace(&mut self.core.borrow_mut().buffering_waker, true) {
            return;
        }
        let weak = Rc::downgrade(self);
        let event_loop = self.event_loop.clone();
        source.borrow_mut().set_waker(Some(Rc::new(move || {
            let weak = weak.clone();
            event_loop.post(move || {
                if let Some(reply) = weak.upgrade() {
                    reply.buffer_upload();
                }
            });
        })));
    }

    pub(super) fn start(self: &Rc<Self>) {
        if self.is_terminal() {
            return;
        }
        let caps = self.backend.borrow().as_ref().map(|b| b.capabilities());
        let Some(caps) = caps else {
            let scheme = self.request.borrow().url().scheme().to_owned();
            self.fail(ErrorKind::ProtocolUnknown, format!("Protocol \"{scheme}\" is unknown"));
            return;
        };
        self.set_state(ReplyState::Working);
        {
            let mut core = self.core.borrow_mut();
            core.zero_copy = caps.is_zero_copy();
            core.networked = caps.target == TargetType::Networked;
        }

        if caps.target == TargetType::Networked {
            let url = self.request.borrow().url().clone();
            let proxies = match self.manager() {
                Some(manager) => manager.proxy_resolver().resolve(&url),
                None => vec![Proxy::NoProxy],
            };
            if proxies.is_empty() {
                self.fail(ErrorKind::ProxyNotFound, "No suitable proxy found");
                return;
            }
            self.core.borrow_mut().current_proxy = proxies.first().cloned();
            if let Some(backend) = self.backend.borrow_mut().as_mut() {
                backend.set_proxy_list(proxies);
            }
        }

        let (ssl, ignore_ssl) = {
            let core = self.core.borrow();
            let ssl = core
                .ssl
                .clone()
                .or_else(|| self.request.borrow().ssl_configuration().cloned());
            (ssl, core.ignore_ssl_errors)
        };
        if ssl.is_some() || ignore_ssl {
            if caps.security == SecurityFeature::Tls {
                if let Some(backend) = self.backend.borrow_mut().as_mut() {
                    if let Some(ssl) = &ssl {
                        backend.set_ssl_configuration(ssl);
                    }
                    if ignore_ssl {
                        backend.ignore_ssl_errors();
                    }
                }
            } else {
                warn!(reply = self.id, "TLS settings ignored by a backend without TLS");
            }
        }

        self.arm_transfer_timer();
        let ctx = BackendContext::new(Rc::downgrade(self), self.generation.get());
        let synchronous = {
            let mut core = self.core.borrow_mut();
            core.sync_draining = core.synchronous;
            core.synchronous
        };
        trace!(reply = self.id, url = %self.request.borrow().url(), "opening backend");
        if let Some(backend) = self.backend.borrow_mut().as_mut() {
            backend.open(ctx);
        }
        if synchronous {
            self.drain_sync();
        }
    }

    // Downstream.

    fn next_downstream_block_size(&self) -> usize {
        let core = self.core.borrow();
        if core.read_buffer_max == 0 {
            self.settings.downstream_block_size
        } else {
            core.read_buffer_max.saturating_sub(core.read_buffer.len())
        }
    }

    fn pull_downstream(self: &Rc<Self>) {
        if self.core.borrow().zero_copy {
            self.announce_zero_copy();
            return;
        }
        loop {
            if self.is_terminal() {
                return;
            }
            let want = self.next_downstream_block_size();
            if want == 0 || self.pull_block(want) == 0 {
                return;
            }
            self.emit(ReplyEvent::ReadyRead);
            if self.is_terminal() {
                return;
            }
            self.emit_download_progress(false);
        }
    }

    /// Move up to `max` bytes from the backend into the read buffer.
    fn pull_block(self: &Rc<Self>, max: usize) -> usize {
        let (mut buffer, mirror) = {
            let mut core = self.core.borrow_mut();
            let mirror = core.cache_writer.is_some();
            (mem::take(&mut core.read_buffer), mirror)
        };
        let mut copy = None;
        let n = {
            let mut backend = self.backend.borrow_mut();
            match backend.as_mut() {
                Some(backend) => {
                    let available = usize::try_from(backend.bytes_available()).unwrap_or(usize::MAX);
                    let want = max.min(available);
                    if want == 0 {
                        0
                    } else {
                        let dst = buffer.reserve(want);
                        let n = backend.read(dst).min(want);
                        if mirror && n > 0 {
                            copy = Some(Bytes::copy_from_slice(&dst[..n]));
                        }
                        buffer.chop(want - n);
                        n
                    }
                }
                None => 0,
            }
        };
        {
            let mut core = self.core.borrow_mut();
            core.read_buffer = buffer;
            core.downloaded += n as u64;
            if let (Some(writer), Some(copy)) = (core.cache_writer.as_mut(), copy) {
                writer.write(&copy);
            }
        }
        if n > 0 {
            self.arm_transfer_timer();
        }
        n
    }

    fn announce_zero_copy(self: &Rc<Self>) {
        let available = self
            .backend
            .borrow()
            .as_ref()
            .map_or(0, |b| b.bytes_available());
        let fresh = {
            let mut core = self.core.borrow_mut();
            let fresh = available.saturating_sub(core.zero_copy_pending);
            core.zero_copy_pending = available;
            core.downloaded += fresh;
            fresh
        };
        if fresh == 0 {
            return;
        }
        self.arm_transfer_timer();
        self.emit(ReplyEvent::ReadyRead);
        if self.is_terminal() {
            return;
        }
        self.emit_download_progress(false);
    }

    pub(super) fn read_zero_copy(self: &Rc<Self>, dst: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dst.len() {
            let pending = usize::try_from(self.core.borrow().zero_copy_pending).unwrap_or(usize::MAX);
            let want = (dst.len() - total).min(pending);
            if want == 0 {
                break;
            }
            let n = {
                let mut backend = self.backend.borrow_mut();
                let Some(backend) = backend.as_mut() else {
                    break;
                };
                let src = backend.read_pointer();
                let n = src.len().min(want);
                dst[total..total + n].copy_from_slice(&src[..n]);
                backend.advance_read_pointer(n);
                n
            };
            if n == 0 {
                break;
            }
            let mut core = self.core.borrow_mut();
            core.zero_copy_pending -= n as u64;
            if let Some(writer) = core.cache_writer.as_mut() {
                writer.write(&dst[total..total + n]);
            }
            total += n;
        }
        total
    }

    /// Copy announced zero-copy bytes into the read buffer so buffered
    /// operations (peek, lines) can see them.
    pub(super) fn materialize(self: &Rc<Self>) {
        loop {
            let pending = usize::try_from(self.core.borrow().zero_copy_pending).unwrap_or(usize::MAX);
            if pending == 0 {
                return;
            }
            let chunk = {
                let mut backend = self.backend.borrow_mut();
                match backend.as_mut() {
                    Some(backend) => {
                        let src = backend.read_pointer();
                        let n = src.len().min(pending);
                        let data = Bytes::copy_from_slice(&src[..n]);
                        if n > 0 {
                            backend.advance_read_pointer(n);
                            Some(data)
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            let mut core = self.core.borrow_mut();
            let Some(chunk) = chunk else {
                core.zero_copy_pending = 0;
                return;
            };
            core.zero_copy_pending -= chunk.len() as u64;
            if let Some(writer) = core.cache_writer.as_mut() {
                writer.write(&chunk);
            }
            core.read_buffer.append_bytes(chunk);
        }
    }

    pub(super) fn after_caller_read(self: &Rc<Self>) {
        let resume = {
            let core = self.core.borrow();
            core.read_buffer_max > 0 && core.state == ReplyState::Working && !core.zero_copy
        };
        if resume {
            self.push_notification(Notification::DownstreamReadyWrite);
        }
    }

    /// Pull everything the backend still holds, ignoring the buffer limit.
    fn drain_backend(self: &Rc<Self>) {
        if self.core.borrow().zero_copy {
            self.announce_zero_copy();
            return;
        }
        let mut total = 0;
        loop {
            let n = self.pull_block(self.settings.downstream_block_size);
            if n == 0 {
                break;
            }
            total += n;
        }
        if total > 0 {
            self.emit(ReplyEvent::ReadyRead);
        }
    }

    // Progress.

    fn emit_download_progress(self: &Rc<Self>, force: bool) {
        let event = {
            let mut core = self.core.borrow_mut();
            let received = core.downloaded;
            let total = core.headers.content_length();
            if force {
                Some(ReplyEvent::DownloadProgress {
                    received,
                    total: Some(total.unwrap_or(received)),
                })
            } else if core.synchronous {
                None
            } else {
                let now = self.event_loop.now().into_std();
                core.download_choke
                    .should_emit(now, received, total)
                    .then_some(ReplyEvent::DownloadProgress { received, total })
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn emit_upload_progress(self: &Rc<Self>, force: bool) {
        let event = {
            let mut core = self.core.borrow_mut();
            let (sent, total) = (core.uploaded, core.upload_total);
            if force {
                Some(ReplyEvent::UploadProgress {
                    sent,
                    total: Some(total.unwrap_or(sent)),
                })
            } else if core.synchronous {
                None
            } else {
                let now = self.event_loop.now().into_std();
                core.upload_choke
                    .should_emit(now, sent, total)
                    .then_some(ReplyEvent::UploadProgress { sent, total })
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    pub(super) fn on_upload_progress(self: &Rc<Self>, sent: u64, total: Option<u64>) {
        {
            let mut core = self.core.borrow_mut();
            core.uploaded = sent;
            if total.is_some() {
                core.upload_total = total;
            }
        }
        self.arm_transfer_timer();
        self.push_notification(Notification::UploadProgress);
    }

    fn arm_transfer_timer(self: &Rc<Self>) {
        let (timeout, old) = {
            let mut core = self.core.borrow_mut();
            let Some(timeout) = core.transfer_timeout.filter(|t| !t.is_zero()) else {
                return;
            };
            (timeout, core.transfer_timer.take())
        };
        if let Some(old) = old {
            self.event_loop.cancel(old);
        }
        let weak = Rc::downgrade(self);
        let timer = self.event_loop.post_after(timeout, move || {
            if let Some(reply) = weak.upgrade() {
                reply.core.borrow_mut().transfer_timer = None;
                debug!(reply = reply.id, "transfer timed out");
                reply.fail(ErrorKind::Timeout, "Operation timed out");
            }
        });
        self.core.borrow_mut().transfer_timer = Some(timer);
    }

    // Metadata, cookies and cache.

    fn on_meta_data_changed(self: &Rc<Self>) {
        self.save_cookies();
        self.prepare_cache();
        self.emit(ReplyEvent::MetaDataChanged);
    }

    fn save_cookies(self: &Rc<Self>) {
        let (url, control) = {
            let request = self.request.borrow();
            (request.url().clone(), request.attributes().cookie_save)
        };
        if control == CookieControl::Manual {
            return;
        }
        let now = SystemTime::now();
        let cookies: Vec<Cookie> = {
            let core = self.core.borrow();
            core.headers
                .get_all(KnownHeader::SetCookie.name())
                .filter_map(|value| Cookie::parse_set_cookie(value, now))
                .collect()
        };
        if cookies.is_empty() {
            return;
        }
        if let Some(jar) = self.manager().and_then(|m| m.cookie_jar()) {
            jar.set_cookies_from_url(cookies, &url);
        }
    }

    fn prepare_cache(self: &Rc<Self>) {
        let meta = {
            let mut core = self.core.borrow_mut();
            if mem::replace(&mut core.cache_prepared, true) {
                return;
            }
            let request = self.request.borrow();
            let storable = core
                .headers
                .get("Cache-Control")
                .is_none_or(|v| CacheControl::parse(v).is_storable());
            let eligible = core.networked
                && core.operation == Operation::Get
                && request.attributes().cache_save_allowed.unwrap_or(true)
                && matches!(core.attributes.http_status, None | Some(200))
                && !core.attributes.source_is_from_cache
                && storable;
            if !eligible {
                return;
            }
            CacheMetaData::from_response(
                request.url().clone(),
                core.headers.clone(),
                core.attributes.clone(),
            )
        };
        let Some(cache) = self.manager().and_then(|m| m.cache()) else {
            return;
        };
        let writer = cache.prepare(meta);
        self.core.borrow_mut().cache_writer = writer;
    }

    fn complete_cache(self: &Rc<Self>) {
        let (writer, complete) = {
            let mut core = self.core.borrow_mut();
            let Some(writer) = core.cache_writer.take() else {
                return;
            };
            let expected = core.headers.content_length();
            let complete = core.error.is_none()
                && writer.len() as u64 == core.downloaded
                && expected.is_none_or(|t| t == core.downloaded);
            (writer, complete)
        };
        let Some(cache) = self.manager().and_then(|m| m.cache()) else {
            return;
        };
        if complete {
            cache.insert(writer);
        } else {
            debug!(reply = self.id, "incomplete response discarded from cache");
            cache.remove(&writer.meta().url);
        }
    }

    // Errors and termination.

    /// Record the error unless one is already set.
    pub(super) fn set_error(&self, kind: ErrorKind, message: impl Into<String>) -> bool {
        let mut core = self.core.borrow_mut();
        if let Some(existing) = &core.error {
            warn!(reply = self.id, existing = ?existing.kind, ignored = ?kind, "reply error already set");
            return false;
        }
        core.error = Some(ReplyError::new(kind, message));
        true
    }

    fn emit_error(self: &Rc<Self>) {
        let error = {
            let mut core = self.core.borrow_mut();
            if core.error_emitted {
                return;
            }
            let Some(error) = core.error.clone() else {
                return;
            };
            core.error_emitted = true;
            error
        };
        debug!(reply = self.id, kind = ?error.kind, message = %error.message, "reply error");
        self.emit(ReplyEvent::Error(error));
    }

    fn unset_source_waker(&self) {
        let upload = self.core.borrow().upload.clone();
        if let Upload::Source(source) = upload {
            source.borrow_mut().set_waker(None);
        }
    }

    /// Disconnect and close the current backend; late reports from it are
    /// ignored from here on.
    fn teardown(self: &Rc<Self>) {
        self.generation.set(self.generation.get() + 1);
        let backend = self.backend.borrow_mut().take();
        let (wakers, timer) = {
            let mut core = self.core.borrow_mut();
            core.notifications.clear();
            core.zero_copy_pending = 0;
            (mem::take(&mut core.wakers), core.transfer_timer.take())
        };
        drop(wakers);
        if let Some(timer) = timer {
            self.event_loop.cancel(timer);
        }
        if let Some(mut backend) = backend {
            trace!(reply = self.id, "closing backend");
            backend.close();
        }
    }

    pub(super) fn fail(self: &Rc<Self>, kind: ErrorKind, message: impl Into<String>) {
        {
            let mut core = self.core.borrow_mut();
            if core.state.is_terminal() || core.finishing {
                return;
            }
            core.finishing = true;
        }
        self.unset_source_waker();
        self.teardown();
        self.set_error(kind, message);
        self.emit_error();
        self.finish();
    }

    pub(super) fn abort(self: &Rc<Self>) {
        {
            let mut core = self.core.borrow_mut();
            if core.state.is_terminal() || core.finishing {
                return;
            }
            core.finishing = true;
        }
        debug!(reply = self.id, "aborting");
        self.unset_source_waker();
        self.teardown();
        if self.core.borrow().error.is_none() {
            self.set_error(ErrorKind::OperationCanceled, "Operation canceled");
        }
        self.emit_error();
        self.finish_as(ReplyState::Aborted);
        let mut core = self.core.borrow_mut();
        core.open = false;
        core.read_buffer.clear();
    }

    pub(super) fn close(self: &Rc<Self>) {
        if !self.is_terminal() {
            self.abort();
            return;
        }
        self.teardown();
        let mut core = self.core.borrow_mut();
        core.open = false;
        core.read_buffer.clear();
    }

    pub(super) fn finish(self: &Rc<Self>) {
        self.finish_as(ReplyState::Finished);
    }

    fn finish_as(self: &Rc<Self>, terminal: ReplyState) {
        if self.is_terminal() {
            return;
        }
        self.drain_backend();
        if self.is_terminal() {
            return;
        }
        self.set_state(terminal);
        let (timer, wakers, synchronous, uploaded) = {
            let mut core = self.core.borrow_mut();
            core.notifications.clear();
            let uploaded = !matches!(core.upload, Upload::None) || core.uploaded > 0;
            (
                core.transfer_timer.take(),
                mem::take(&mut core.wakers),
                core.synchronous,
                uploaded,
            )
        };
        if let Some(timer) = timer {
            self.event_loop.cancel(timer);
        }
        drop(wakers);
        self.unset_source_waker();

        self.emit_error();
        if !synchronous {
            if uploaded {
                self.emit_upload_progress(true);
            }
            self.emit_download_progress(true);
        }
        if self.core.borrow().cache_writer.is_some() {
            self.materialize();
        }
        self.complete_cache();
        self.emit(ReplyEvent::ReadChannelFinished);
        self.emit(ReplyEvent::Finished);

        if let Some(manager) = self.manager() {
            manager.reply_finished(&self.handle());
        }
    }

    pub(super) fn dispose(self: &Rc<Self>) {
        if mem::replace(&mut self.core.borrow_mut().disposed, true) {
            return;
        }
        if !self.is_terminal() {
            self.abort();
        }
        self.emit(ReplyEvent::Destroyed);
        self.listeners.borrow_mut().clear();
        self.teardown();
        {
            let mut core = self.core.borrow_mut();
            core.open = false;
            core.read_buffer.clear();
        }
        if let Some(manager) = self.manager() {
            manager.untrack(self.id);
        }
    }

    // Redirects and authentication.

    fn on_redirect(self: &Rc<Self>, target: Url, status: u16) {
        let (policy, left) = {
            let mut core = self.core.borrow_mut();
            core.attributes.redirection_target = Some(target.clone());
            (core.redirect_policy, core.redirects_left)
        };
        if policy == RedirectPolicy::Manual {
            debug!(reply = self.id, %target, "redirect left to the caller");
            return;
        }
        if left == 0 {
            self.fail(ErrorKind::TooManyRedirects, "Too many redirects");
            return;
        }
        let from = self.request.borrow().url().clone();
        if let Some(kind) = redirect_refusal(policy, &from, &target) {
            debug!(reply = self.id, %from, %target, ?policy, "redirect refused");
            self.fail(kind, format!("Insecure redirect to {target}"));
            return;
        }
        if policy == RedirectPolicy::UserVerified {
            self.teardown();
            self.core.borrow_mut().pending_redirect = Some((target.clone(), status));
            self.emit(ReplyEvent::RedirectPending(target));
            return;
        }
        self.follow(target, status);
    }

    pub(super) fn follow(self: &Rc<Self>, target: Url, status: u16) {
        if self.is_terminal() {
            return;
        }
        {
            let mut core = self.core.borrow_mut();
            core.redirects_left = core.redirects_left.saturating_sub(1);
        }
        debug!(reply = self.id, %target, status, "following redirect");
        self.emit(ReplyEvent::Redirected(target.clone()));
        if self.is_terminal() {
            return;
        }

        let operation = self.core.borrow().operation;
        let next = redirected_operation(operation, status);
        {
            let mut request = self.request.borrow_mut();
            request.set_url(target);
            if next != operation {
                request.remove_raw_header(KnownHeader::ContentType.name());
                request.remove_raw_header(KnownHeader::ContentLength.name());
            }
            if let Some(manager) = self.manager() {
                manager.prepare_redirect(&mut request);
            }
        }
        if next != operation {
            let mut core = self.core.borrow_mut();
            core.operation = next;
            core.upload = Upload::None;
            core.upload_total = None;
            core.uploaded = 0;
        }
        self.restart();
    }

    fn on_authentication_required(self: &Rc<Self>, proxy: bool, realm: String) {
        self.teardown();
        let url = {
            let core = self.core.borrow();
            let proxy_url = core.current_proxy.as_ref().and_then(Proxy::url).cloned();
            match proxy_url {
                Some(url) if proxy => url,
                _ => self.request.borrow().url().clone(),
            }
        };
        let challenge = AuthChallenge { url, realm, proxy };
        let key = CredentialKey::for_challenge(&challenge);
        let (attempt, last) = {
            let mut core = self.core.borrow_mut();
            if proxy {
                core.proxy_auth_attempts += 1;
                (core.proxy_auth_attempts, core.last_proxy_credentials.clone())
            } else {
                core.auth_attempts += 1;
                (core.auth_attempts, core.last_credentials.clone())
            }
        };

        let manager = self.manager();
        let mut credentials = None;
        if attempt == 1 {
            credentials = manager.as_ref().and_then(|m| m.credential_cache().get(&key));
        }
        if credentials.is_none() {
            credentials = manager
                .as_ref()
                .and_then(|m| m.authenticate(&self.handle(), &challenge));
        }
        if self.is_terminal() {
            return;
        }

        match credentials {
            Some(credentials) if !credentials.is_empty() && last.as_ref() != Some(&credentials) => {
                debug!(reply = self.id, proxy, realm = %challenge.realm, "retrying with credentials");
                if let Some(manager) = &manager {
                    manager.credential_cache().insert(key, credentials.clone());
                }
                let header = if proxy {
                    "Proxy-Authorization"
                } else {
                    "Authorization"
                };
                self.request
                    .borrow_mut()
                    .set_raw_header(header, credentials.basic_header());
                {
                    let mut core = self.core.borrow_mut();
                    if proxy {
                        core.last_proxy_credentials = Some(credentials);
                    } else {
                        core.last_credentials = Some(credentials);
                    }
                }
                self.restart();
            }
            _ if proxy => self.fail(
                ErrorKind::ProxyAuthenticationRequired,
                "Proxy requires authentication",
            ),
            _ => self.fail(
                ErrorKind::AuthenticationRequired,
                "Host requires authentication",
            ),
        }
    }

    /// Run the request again on a fresh backend.
    fn restart(self: &Rc<Self>) {
        self.teardown();
        let upload = self.core.borrow().upload.clone();
        if let Upload::Source(source) = upload {
            if !source.borrow_mut().reset() {
                self.fail(ErrorKind::ContentReSend, "Upload data cannot be resent");
                return;
            }
        }
        {
            let mut core = self.core.borrow_mut();
            let target = core.attributes.redirection_target.take();
            core.attributes = ReplyAttributes {
                redirection_target: target,
                ..ReplyAttributes::default()
            };
            core.headers.clear();
            core.read_buffer.clear();
            core.downloaded = 0;
            core.uploaded = 0;
            core.download_choke.reset();
            core.upload_choke.reset();
            core.cache_writer = None;
            core.cache_prepared = false;
        }
        let operation = self.core.borrow().operation;
        let backend = self
            .manager()
            .and_then(|m| m.create_backend(operation, &self.request.borrow()));
        if backend.is_none() {
            let scheme = self.request.borrow().url().scheme().to_owned();
            self.fail(ErrorKind::ProtocolUnknown, format!("Protocol \"{scheme}\" is unknown"));
            return;
        }
        *self.backend.borrow_mut() = backend;
        self.start();
    }

    pub(super) fn wake_backend(self: &Rc<Self>, generation: u64) {
        if generation != self.generation.get() || self.is_terminal() {
            return;
        }
        if let Some(backend) = self.backend.borrow_mut().as_mut() {
            backend.wake();
        }
    }
}
