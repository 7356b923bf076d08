//! Expiry-ordered, reference-counted object cache.
//!
//! Used to pool long-lived resources such as open connections. Entries are
//! addressed by an opaque byte key; idle entries expire after a TTL while
//! entries in use are never evicted by the sweep.
//!
//! ```
//! use std::time::{Duration, Instant};
//! use tether_cache::{Cacheable, ExpiryCache};
//!
//! #[derive(Clone)]
//! struct Session;
//!
//! impl Cacheable for Session {
//!     fn is_shareable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! let mut cache = ExpiryCache::new(Duration::from_secs(120));
//! cache.add_entry("host:443", Session, None);
//! assert!(cache.request_entry_now(b"host:443").is_some());
//! assert_eq!(cache.use_count(b"host:443"), Some(2));
//!
//! let now = Instant::now();
//! cache.release_entry(b"host:443", now);
//! cache.release_entry(b"host:443", now);
//! assert_eq!(cache.next_deadline(), Some(now + Duration::from_secs(120)));
//! ```

mod arena;
mod expiry;

use std::rc::Rc;
use std::sync::Arc;

pub use expiry::{DEFAULT_TTL, ExpiryCache};

/// An object that can live in an [`ExpiryCache`].
pub trait Cacheable {
    /// Whether several holders may use the object at the same time.
    fn is_shareable(&self) -> bool;

    /// Whether the object is evicted after idling for its TTL.
    fn expires(&self) -> bool {
        true
    }

    /// Called once when the cache drops the entry.
    fn dispose(&self) {}
}

impl<T: Cacheable + ?Sized> Cacheable for Rc<T> {
    fn is_shareable(&self) -> bool {
        (**self).is_shareable()
    }

    fn expires(&self) -> bool {
        (**self).expires()
    }

    fn dispose(&self) {
        (**self).dispose()
    }
}

impl<T: Cacheable + ?Sized> Cacheable for Arc<T> {
    fn is_shareable(&self) -> bool {
        (**self).is_shareable()
    }

    fn expires(&self) -> bool {
        (**self).expires()
    }

    fn dispose(&self) {
        (**self).dispose()
    }
}
