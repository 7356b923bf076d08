//! Event-driven machinery: the loop, replies, backends and the manager.
//!
//! Everything here is single-threaded and lives on one [`EventLoop`].
//! Work that crosses threads (HTTP transfers, upload producers) reports
//! back through a [`RemoteWaker`].

mod access_cache;
mod backend;
pub mod backends;
mod cache_store;
mod cookie_jar;
mod credentials;
mod hsts;
mod manager;
mod proxy;
pub mod registry;
mod reply;
mod runtime;
mod upload;

pub use access_cache::{AccessCache, Pooled, PooledObject, RequestOutcome};
pub use backend::{
    Backend, BackendFactory, Capabilities, IoFeatures, SecurityFeature, TargetType,
};
pub use cache_store::{CacheStore, MemoryCache};
pub use cookie_jar::{CookieJar, MemoryCookieJar};
pub use credentials::CredentialCache;
pub use hsts::{HstsCache, HstsStore};
pub use manager::{Authenticator, Manager};
pub use proxy::{NoProxyResolver, ProxyResolver, StaticProxyResolver};
pub use registry::BackendRegistry;
pub use reply::{BackendContext, Listener, ListenerId, Reply, ReplyEvent, ReplyState};
pub use runtime::{EventLoop, RemoteWaker, TimerId, WakeRegistration};
pub use upload::{ChannelSource, UploadSender, upload_channel};
