//! The contract every protocol backend implements.

use std::fmt;
use std::ops::BitOr;

use tracing::warn;

use super::reply::BackendContext;
use crate::data::{Operation, Proxy, Request, SslConfiguration};

/// Whether the backend reaches its target over the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    /// Proxies are resolved before the backend is opened.
    Networked,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityFeature {
    None,
    /// The TLS hooks of [`Backend`] are implemented.
    Tls,
}

/// Set of I/O capabilities a backend opts into.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IoFeatures(u8);

impl IoFeatures {
    pub const NONE: Self = Self(0);
    /// Reads go through [`Backend::read_pointer`] and
    /// [`Backend::advance_read_pointer`] instead of [`Backend::read`].
    pub const ZERO_COPY: Self = Self(1);
    /// Upload data must be replayable, so sequential bodies sent without a
    /// Content-Length header are buffered before the backend opens.
    pub const NEEDS_RESETTABLE_UPLOAD: Self = Self(1 << 1);
    pub const SUPPORTS_SYNCHRONOUS: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for IoFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for IoFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ZERO_COPY, "ZERO_COPY"),
            (Self::NEEDS_RESETTABLE_UPLOAD, "NEEDS_RESETTABLE_UPLOAD"),
            (Self::SUPPORTS_SYNCHRONOUS, "SUPPORTS_SYNCHRONOUS"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&set.join(" | "))
        }
    }
}

/// The three independent capability tags of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub target: TargetType,
    pub security: SecurityFeature,
    pub io: IoFeatures,
}

impl Capabilities {
    pub fn local(io: IoFeatures) -> Self {
        Self {
            target: TargetType::Local,
            security: SecurityFeature::None,
            io,
        }
    }

    pub fn networked(security: SecurityFeature, io: IoFeatures) -> Self {
        Self {
            target: TargetType::Networked,
            security,
            io,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        self.io.contains(IoFeatures::ZERO_COPY)
    }
}

/// A protocol implementation driving one transfer.
///
/// Backends report through the [`BackendContext`] handed to
/// [`open`](Backend::open): `ready_read` as data arrives, `error` at most
/// once and before `finished`, and `finished` exactly once. Context calls
/// never re-enter the backend; the reply reacts on a later loop iteration.
///
/// [`close`](Backend::close) is only called on teardown and must not
/// report anything.
pub trait Backend {
    fn capabilities(&self) -> Capabilities;

    fn open(&mut self, ctx: BackendContext);

    fn close(&mut self);

    /// Bytes ready to be read right now.
    fn bytes_available(&self) -> u64;

    fn read(&mut self, _buf: &mut [u8]) -> usize {
        warn!("read called on a backend without buffered reads");
        0
    }

    fn read_pointer(&self) -> &[u8] {
        &[]
    }

    fn advance_read_pointer(&mut self, _amount: usize) {}

    /// Routes to try, best first. Only called for networked backends.
    fn set_proxy_list(&mut self, _proxies: Vec<Proxy>) {}

    fn set_ssl_configuration(&mut self, _config: &SslConfiguration) {
        warn!("backend does not support TLS configuration");
    }

    fn ssl_configuration(&self) -> Option<SslConfiguration> {
        warn!("backend does not support TLS configuration");
        None
    }

    fn ignore_ssl_errors(&mut self) {
        warn!("backend does not support ignoring TLS errors");
    }

    /// Called on the loop when a waker handed out by the context fires.
    fn wake(&mut self) {}
}

/// Creates backends for the schemes it supports.
pub trait BackendFactory: Send + Sync {
    fn supported_schemes(&self) -> Vec<String>;

    /// `None` when this factory cannot handle the operation or scheme.
    fn create(&self, operation: Operation, request: &Request) -> Option<Box<dyn Backend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_features() {
        let io = IoFeatures::ZERO_COPY | IoFeatures::SUPPORTS_SYNCHRONOUS;
        assert!(io.contains(IoFeatures::ZERO_COPY));
        assert!(io.contains(IoFeatures::SUPPORTS_SYNCHRONOUS));
        assert!(!io.contains(IoFeatures::NEEDS_RESETTABLE_UPLOAD));
        assert!(io.contains(IoFeatures::NONE));
        assert_eq!(format!("{io:?}"), "ZERO_COPY | SUPPORTS_SYNCHRONOUS");
        assert_eq!(format!("{:?}", IoFeatures::NONE), "NONE");
    }

    #[test]
    fn test_capability_constructors() {
        let caps = Capabilities::local(IoFeatures::ZERO_COPY);
        assert_eq!(caps.target, TargetType::Local);
        assert!(caps.is_zero_copy());
        let caps = Capabilities::networked(SecurityFeature::Tls, IoFeatures::NONE);
        assert_eq!(caps.security, SecurityFeature::Tls);
        assert!(!caps.is_zero_copy());
    }
}
