//! Error types for tether.
//!
//! [`Error`] covers failures of the library surface itself (bad URLs,
//! configuration). Failures of a running transfer are reported on the
//! reply as a [`ReplyError`] instead.

use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which part of the stack an [`ErrorKind`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLayer {
    Connection,
    Proxy,
    Content,
    Protocol,
    Server,
}

/// Failure kinds a reply can finish with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionRefused,
    RemoteHostClosed,
    HostNotFound,
    Timeout,
    OperationCanceled,
    SslHandshakeFailed,
    TemporaryNetworkFailure,
    NetworkSessionFailed,
    BackgroundRequestNotAllowed,
    TooManyRedirects,
    InsecureRedirect,
    UnknownNetwork,

    ProxyConnectionRefused,
    ProxyConnectionClosed,
    ProxyNotFound,
    ProxyTimeout,
    ProxyAuthenticationRequired,
    UnknownProxy,

    ContentAccessDenied,
    ContentOperationNotPermitted,
    ContentNotFound,
    AuthenticationRequired,
    ContentReSend,
    ContentConflict,
    ContentGone,
    UnknownContent,

    ProtocolUnknown,
    ProtocolInvalidOperation,
    ProtocolFailure,

    InternalServerError,
    OperationNotImplemented,
    ServiceUnavailable,
    UnknownServer,
}

impl ErrorKind {
    pub fn layer(self) -> ErrorLayer {
        use ErrorKind::*;
        match self {
            ConnectionRefused | RemoteHostClosed | HostNotFound | Timeout | OperationCanceled
            | SslHandshakeFailed | TemporaryNetworkFailure | NetworkSessionFailed
            | BackgroundRequestNotAllowed | TooManyRedirects | InsecureRedirect
            | UnknownNetwork => ErrorLayer::Connection,
            ProxyConnectionRefused | ProxyConnectionClosed | ProxyNotFound | ProxyTimeout
            | ProxyAuthenticationRequired | UnknownProxy => ErrorLayer::Proxy,
            ContentAccessDenied | ContentOperationNotPermitted | ContentNotFound
            | AuthenticationRequired | ContentReSend | ContentConflict | ContentGone
            | UnknownContent => ErrorLayer::Content,
            ProtocolUnknown | ProtocolInvalidOperation | ProtocolFailure => ErrorLayer::Protocol,
            InternalServerError | OperationNotImplemented | ServiceUnavailable | UnknownServer => {
                ErrorLayer::Server
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The error a reply finished with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ReplyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn layer(&self) -> ErrorLayer {
        self.kind.layer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers() {
        assert_eq!(ErrorKind::OperationCanceled.layer(), ErrorLayer::Connection);
        assert_eq!(ErrorKind::ProxyNotFound.layer(), ErrorLayer::Proxy);
        assert_eq!(ErrorKind::ContentReSend.layer(), ErrorLayer::Content);
        assert_eq!(ErrorKind::ProtocolUnknown.layer(), ErrorLayer::Protocol);
        assert_eq!(ErrorKind::ServiceUnavailable.layer(), ErrorLayer::Server);
    }

    #[test]
    fn test_reply_error_display_is_message() {
        let err = ReplyError::new(ErrorKind::ContentNotFound, "no such file");
        assert_eq!(err.to_string(), "no such file");
        assert_eq!(err.layer(), ErrorLayer::Content);
    }

    #[test]
    fn test_config_error_converts() {
        let err: Error = toml::from_str::<toml::Value>("= nope").unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
