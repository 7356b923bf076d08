//! Backends shipped with the crate.
//!
//! `data:`, `file:`, resources and the cache are served locally and
//! support synchronous replies. HTTP goes through reqwest.

mod cache;
mod file;
#[cfg(feature = "reqwest")]
mod http;
mod memory;

pub use cache::CacheBackend;
pub use file::{FileBackendFactory, LocalFileBackend};
#[cfg(feature = "reqwest")]
pub use http::{HttpBackend, HttpBackendFactory};
pub use memory::{DataBackend, ResourceBackend};
