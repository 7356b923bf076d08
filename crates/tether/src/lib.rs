//! Asynchronous network request execution with pluggable backends.
//!
//! # Architecture
//!
//! This crate follows the three-layer pattern:
//! - [`data`] - Immutable requests, attributes and configuration
//! - [`core`] - Pure transformations (cookies, cache control, redirects)
//! - [`effects`] - The event loop, replies, backends and the manager
//!
//! # Overview
//!
//! A [`Manager`] dispatches a [`Request`] to a backend and hands back a
//! [`Reply`]. The reply buffers downloaded bytes, reports progress, follows
//! redirects, retries authentication and commits cacheable responses;
//! callers observe it through [`ReplyEvent`]s while an [`EventLoop`]
//! drives the work.
//!
//! ```
//! use tether::{EventLoop, Manager, ReplyEvent, Request};
//!
//! let event_loop = EventLoop::new();
//! let manager = Manager::new(&event_loop);
//! let reply = manager.get(Request::parse("data:,hello").unwrap());
//! reply.connect(|_, event| {
//!     if let ReplyEvent::Finished = event {
//!         println!("done");
//!     }
//! });
//! event_loop.run_until_idle();
//! assert!(reply.is_finished());
//! assert_eq!(&reply.read_all()[..], b"hello");
//! ```

pub mod core;
pub mod data;
pub mod effects;
mod error;

pub use data::{
    CacheLoadControl, CookieControl, Credentials, KnownHeader, ManagerConfig, Operation, Priority,
    Proxy, RedirectPolicy, ReplyAttributes, Request, RequestAttributes, SslConfiguration,
};
pub use effects::{
    Backend, BackendContext, BackendFactory, BackendRegistry, EventLoop, Manager, Reply,
    ReplyEvent, ReplyState, upload_channel,
};
pub use error::{Error, ErrorKind, ErrorLayer, ReplyError, Result};

pub use tether_buffer::{BytesSource, SharedSource, SourceRead, UploadSource};
