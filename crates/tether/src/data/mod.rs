//! Immutable request, reply and configuration types.
//!
//! Everything here is plain data that can be cloned and passed between
//! the pure transformations in [`core`](crate::core) and the event-driven
//! machinery in [`effects`](crate::effects).

pub mod attributes;
pub mod auth;
pub mod cache;
pub mod config;
pub mod headers;
pub mod network;
pub mod request;

pub use attributes::{
    CacheLoadControl, CookieControl, Priority, RedirectPolicy, ReplyAttributes, RequestAttributes,
};
pub use auth::{AuthChallenge, CredentialKey, Credentials, realm_from_challenge};
pub use cache::{CacheMetaData, CacheWriter};
pub use config::ManagerConfig;
pub use headers::{KnownHeader, RawHeaders};
pub use network::{Proxy, SslConfiguration};
pub use request::{Operation, Request};
