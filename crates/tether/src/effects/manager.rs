//! The request dispatcher.
//!
//! A [`Manager`] turns requests into [`Reply`] objects. Local schemes
//! (`file`, `qrc`, `data`) and cache-only loads are served by built-in
//! backends; everything else is resolved through the [`BackendRegistry`]
//! after the manager has applied its defaults, upgraded the URL for
//! Strict-Transport-Security hosts, and attached cookies.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tether_buffer::SharedSource;
use tracing::{debug, trace};
use url::Url;

use super::access_cache::{AccessCache, PooledObject};
use super::backend::Backend;
use super::backends::{CacheBackend, DataBackend, LocalFileBackend, ResourceBackend};
use super::cache_store::CacheStore;
use super::cookie_jar::{CookieJar, MemoryCookieJar};
use super::credentials::CredentialCache;
use super::hsts::{HstsCache, HstsStore};
use super::proxy::{NoProxyResolver, ProxyResolver};
use super::registry::{self, BackendRegistry};
use super::reply::{Reply, ReplyOptions, ReplySettings};
use super::runtime::EventLoop;
use crate::core::cookie_header;
use crate::data::{
    AuthChallenge, CacheLoadControl, CookieControl, Credentials, KnownHeader, ManagerConfig,
    Operation, Request,
};

/// Asked for credentials when a host or proxy requires authentication.
/// Returning `None` gives up and fails the reply.
pub type Authenticator = Rc<dyn Fn(&Reply, &AuthChallenge) -> Option<Credentials>>;

pub(crate) struct ManagerShared {
    event_loop: EventLoop,
    config: ManagerConfig,
    registry: Arc<BackendRegistry>,
    replies: RefCell<HashMap<u64, Reply>>,
    next_id: Cell<u64>,
    cache: RefCell<Option<Rc<dyn CacheStore>>>,
    cookie_jar: RefCell<Option<Rc<dyn CookieJar>>>,
    hsts: RefCell<Rc<dyn HstsStore>>,
    hsts_enabled: Cell<bool>,
    proxy_resolver: RefCell<Rc<dyn ProxyResolver>>,
    credentials: RefCell<CredentialCache>,
    authenticator: RefCell<Option<Authenticator>>,
    resources: RefCell<HashMap<String, Bytes>>,
    connections: AccessCache<PooledObject>,
}

impl ManagerShared {
    pub(crate) fn cookie_jar(&self) -> Option<Rc<dyn CookieJar>> {
        self.cookie_jar.borrow().clone()
    }

    pub(crate) fn cache(&self) -> Option<Rc<dyn CacheStore>> {
        self.cache.borrow().clone()
    }

    pub(crate) fn proxy_resolver(&self) -> Rc<dyn ProxyResolver> {
        self.proxy_resolver.borrow().clone()
    }

    pub(crate) fn credential_cache(&self) -> CredentialCache {
        self.credentials.borrow().clone()
    }

    pub(crate) fn connections(&self) -> AccessCache<PooledObject> {
        self.connections.clone()
    }

    pub(crate) fn authenticate(&self, reply: &Reply, challenge: &AuthChallenge) -> Option<Credentials> {
        let authenticator = self.authenticator.borrow().clone()?;
        authenticator(reply, challenge)
    }

    /// Rewrite a request for its next hop after a redirect.
    pub(crate) fn prepare_redirect(&self, request: &mut Request) {
        request.remove_raw_header(KnownHeader::Cookie.name());
        self.prepare_network_request(request);
    }

    pub(crate) fn create_backend(&self, operation: Operation, request: &Request) -> Option<Box<dyn Backend>> {
        let scheme = request.url().scheme().to_ascii_lowercase();
        let local_read = matches!(operation, Operation::Get | Operation::Head);
        if local_read && scheme == "file" {
            trace!("serving local file directly");
            return Some(Box::new(LocalFileBackend::new(operation)));
        }
        if local_read && scheme == "qrc" {
            let resource = self.resources.borrow().get(request.url().path()).cloned();
            return Some(Box::new(ResourceBackend::new(resource)));
        }
        if scheme == "data" {
            return Some(Box::new(DataBackend::new()));
        }
        if request.attributes().cache_load_control == CacheLoadControl::AlwaysCache {
            return Some(Box::new(CacheBackend::new(self.cache())));
        }
        self.registry.find_backend(operation, request)
    }

    pub(crate) fn reply_finished(&self, reply: &Reply) {
        self.untrack(reply.id());
        if reply.auto_delete() {
            let reply = reply.clone();
            self.event_loop.post(move || reply.dispose());
        }
    }

    pub(crate) fn untrack(&self, id: u64) {
        self.replies.borrow_mut().remove(&id);
    }

    fn is_served_locally(&self, operation: Operation, request: &Request) -> bool {
        let scheme = request.url().scheme();
        let local_read = matches!(operation, Operation::Get | Operation::Head);
        (local_read && (scheme.eq_ignore_ascii_case("file") || scheme.eq_ignore_ascii_case("qrc")))
            || scheme.eq_ignore_ascii_case("data")
            || request.attributes().cache_load_control == CacheLoadControl::AlwaysCache
    }

    /// Fill unset per-request options from the configuration.
    fn apply_defaults(&self, request: &mut Request) {
        let config = &self.config;
        let attrs = request.attributes_mut();
        attrs.redirect_policy.get_or_insert(config.redirect_policy);
        attrs.max_redirects.get_or_insert(config.max_redirects);
        attrs.auto_delete.get_or_insert(config.auto_delete_replies);
        if attrs.transfer_timeout.is_none() {
            attrs.transfer_timeout = config.transfer_timeout_duration();
        }
    }

    fn prepare_network_request(&self, request: &mut Request) {
        self.upgrade_to_https(request);
        self.attach_cookies(request);
    }

    fn upgrade_to_https(&self, request: &mut Request) {
        if !self.hsts_enabled.get() || !request.url().scheme().eq_ignore_ascii_case("http") {
            return;
        }
        if !self.hsts.borrow().is_known_host(request.url()) {
            return;
        }
        let mut url = request.url().clone();
        // An explicit :80 is dropped by the url crate, so the default port
        // carries over as 443.
        if url.set_scheme("https").is_ok() {
            debug!(from = %request.url(), to = %url, "strict transport security upgrade");
            request.set_url(url);
        }
    }

    fn attach_cookies(&self, request: &mut Request) {
        if request.attributes().cookie_load == CookieControl::Manual
            || request.header(KnownHeader::Cookie).is_some()
        {
            return;
        }
        let Some(jar) = self.cookie_jar() else {
            return;
        };
        let cookies = jar.cookies_for_url(request.url());
        if !cookies.is_empty() {
            trace!(count = cookies.len(), "attaching cookies");
            request.set_header(KnownHeader::Cookie, cookie_header(&cookies));
        }
    }

    fn serve_from_cache(&self, operation: Operation, request: &Request) -> bool {
        if operation != Operation::Get
            || request.attributes().cache_load_control != CacheLoadControl::PreferCache
        {
            return false;
        }
        self.cache()
            .and_then(|cache| cache.meta_data(request.url()))
            .is_some_and(|meta| meta.is_fresh(SystemTime::now()))
    }
}

/// Entry point for issuing requests on one event loop.
///
/// Dropping the manager aborts every reply still in flight.
pub struct Manager {
    shared: Rc<ManagerShared>,
}

impl Manager {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_config(event_loop, ManagerConfig::default())
    }

    pub fn with_config(event_loop: &EventLoop, config: ManagerConfig) -> Self {
        Self::with_registry(event_loop, config, registry::global())
    }

    /// Resolve backends through `registry` instead of the global one.
    pub fn with_registry(
        event_loop: &EventLoop,
        config: ManagerConfig,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        let connections = AccessCache::new(
            event_loop,
            config.connection_ttl_duration(),
            config.expiry_slack(),
        );
        let jar: Rc<dyn CookieJar> = Rc::new(MemoryCookieJar::new());
        let hsts: Rc<dyn HstsStore> = Rc::new(HstsCache::new());
        let resolver: Rc<dyn ProxyResolver> = Rc::new(NoProxyResolver);
        let hsts_enabled = config.strict_transport_security;
        Self {
            shared: Rc::new(ManagerShared {
                event_loop: event_loop.clone(),
                config,
                registry,
                replies: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                cache: RefCell::new(None),
                cookie_jar: RefCell::new(Some(jar)),
                hsts: RefCell::new(hsts),
                hsts_enabled: Cell::new(hsts_enabled),
                proxy_resolver: RefCell::new(resolver),
                credentials: RefCell::new(CredentialCache::new()),
                authenticator: RefCell::new(None),
                resources: RefCell::new(HashMap::new()),
                connections,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    pub fn head(&self, request: Request) -> Reply {
        self.create_request(Operation::Head, request, None)
    }

    pub fn get(&self, request: Request) -> Reply {
        self.create_request(Operation::Get, request, None)
    }

    pub fn post(&self, request: Request, body: SharedSource) -> Reply {
        self.create_request(Operation::Post, request, Some(body))
    }

    pub fn put(&self, request: Request, body: SharedSource) -> Reply {
        self.create_request(Operation::Put, request, Some(body))
    }

    pub fn delete_resource(&self, request: Request) -> Reply {
        self.create_request(Operation::Delete, request, None)
    }

    /// Send `verb` as-is, with an optional body.
    pub fn send_custom_request(
        &self,
        mut request: Request,
        verb: impl Into<String>,
        body: Option<SharedSource>,
    ) -> Reply {
        request.attributes_mut().custom_verb = Some(verb.into());
        self.create_request(Operation::Custom, request, body)
    }

    /// Dispatch a request. The reply is open and idle on return; it starts
    /// on the next loop iteration (or right away for synchronous requests),
    /// so listeners connected now see every event.
    pub fn create_request(
        &self,
        operation: Operation,
        mut request: Request,
        body: Option<SharedSource>,
    ) -> Reply {
        let shared = &self.shared;
        shared.apply_defaults(&mut request);

        let backend = if shared.is_served_locally(operation, &request) {
            shared.create_backend(operation, &request)
        } else {
            shared.prepare_network_request(&mut request);
            if shared.serve_from_cache(operation, &request) {
                debug!(url = %request.url(), "serving fresh cache entry");
                Some(Box::new(CacheBackend::new(shared.cache())) as Box<dyn Backend>)
            } else {
                shared.create_backend(operation, &request)
            }
        };

        let id = shared.next_id.get();
        shared.next_id.set(id + 1);
        let config = &shared.config;
        let attrs = request.attributes().clone();
        debug!(id, %operation, url = %request.url(), backend = backend.is_some(), "dispatching request");
        let reply = Reply::create(ReplyOptions {
            id,
            event_loop: shared.event_loop.clone(),
            manager: Rc::downgrade(shared),
            settings: ReplySettings {
                progress_interval: config.progress_interval_duration(),
                downstream_block_size: config.downstream_block_size,
                chunk_size: config.ring_chunk_size,
            },
            operation,
            request,
            upload: body,
            backend,
            read_buffer_size: config.read_buffer_size,
            max_redirects: attrs.max_redirects.unwrap_or(config.max_redirects),
            redirect_policy: attrs.redirect_policy.unwrap_or(config.redirect_policy),
            transfer_timeout: attrs.transfer_timeout,
            auto_delete: attrs.auto_delete.unwrap_or(config.auto_delete_replies),
        });
        shared.replies.borrow_mut().insert(id, reply.clone());
        reply.setup();
        reply
    }

    /// Replies that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.shared.replies.borrow().len()
    }

    pub fn set_cache(&self, cache: Option<Rc<dyn CacheStore>>) {
        *self.shared.cache.borrow_mut() = cache;
    }

    pub fn cache(&self) -> Option<Rc<dyn CacheStore>> {
        self.shared.cache()
    }

    /// `None` disables automatic cookie handling.
    pub fn set_cookie_jar(&self, jar: Option<Rc<dyn CookieJar>>) {
        *self.shared.cookie_jar.borrow_mut() = jar;
    }

    pub fn cookie_jar(&self) -> Option<Rc<dyn CookieJar>> {
        self.shared.cookie_jar()
    }

    pub fn set_proxy_resolver(&self, resolver: Rc<dyn ProxyResolver>) {
        *self.shared.proxy_resolver.borrow_mut() = resolver;
    }

    /// Share a credential cache with other managers.
    pub fn set_credential_cache(&self, cache: CredentialCache) {
        *self.shared.credentials.borrow_mut() = cache;
    }

    pub fn credential_cache(&self) -> CredentialCache {
        self.shared.credential_cache()
    }

    pub fn on_authentication_required(
        &self,
        authenticator: impl Fn(&Reply, &AuthChallenge) -> Option<Credentials> + 'static,
    ) {
        *self.shared.authenticator.borrow_mut() = Some(Rc::new(authenticator));
    }

    /// Make `data` available at `qrc:<path>`.
    pub fn register_resource(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.shared
            .resources
            .borrow_mut()
            .insert(path.into(), data.into());
    }

    pub fn set_strict_transport_security_store(&self, store: Rc<dyn HstsStore>) {
        *self.shared.hsts.borrow_mut() = store;
    }

    pub fn set_strict_transport_security_enabled(&self, enabled: bool) {
        self.shared.hsts_enabled.set(enabled);
    }

    pub fn is_strict_transport_security_enabled(&self) -> bool {
        self.shared.hsts_enabled.get()
    }

    pub fn add_strict_transport_security_host(
        &self,
        host: &str,
        max_age: Duration,
        include_subdomains: bool,
    ) {
        let expiry = SystemTime::now() + max_age;
        self.shared
            .hsts
            .borrow()
            .add_policy(host, expiry, include_subdomains);
    }

    /// Schemes some backend can serve.
    pub fn supported_schemes(&self) -> Vec<String> {
        let mut schemes = self.shared.registry.supported_schemes();
        schemes.extend(["file".to_owned(), "qrc".to_owned()]);
        schemes.sort();
        schemes.dedup();
        schemes
    }

    /// Drop pooled connections and remembered credentials.
    pub fn clear_access_cache(&self) {
        self.shared.connections.clear();
        self.shared.credentials.borrow().clear();
    }

    pub fn clear_connection_cache(&self) {
        self.shared.connections.clear();
    }

    /// Pooled objects currently held by the connection cache.
    pub fn connection_cache_len(&self) -> usize {
        self.shared.connections.len()
    }

    /// Whether `url` would be rewritten to `https` by the manager.
    pub fn is_strict_transport_security_host(&self, url: &Url) -> bool {
        self.shared.hsts_enabled.get() && self.shared.hsts.borrow().is_known_host(url)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let replies: Vec<Reply> = self
            .shared
            .replies
            .borrow_mut()
            .drain()
            .map(|(_, reply)| reply)
            .collect();
        if !replies.is_empty() {
            debug!(count = replies.len(), "manager dropped with replies in flight");
        }
        for reply in replies {
            reply.abort();
        }
        self.shared.connections.clear();
    }
}
