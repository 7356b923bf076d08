//! HTTP status classification.

use crate::error::ErrorKind;

/// Returns `true` if the HTTP status code indicates a redirect.
///
/// # Recognized Redirect Codes
///
/// - 301: Moved Permanently
/// - 302: Found
/// - 303: See Other
/// - 307: Temporary Redirect
/// - 308: Permanent Redirect
///
/// # Examples
///
/// ```
/// use tether::core::is_redirect;
///
/// assert!(is_redirect(301));
/// assert!(is_redirect(302));
/// assert!(!is_redirect(200));
/// assert!(!is_redirect(404));
/// ```
pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Error kind a final response status maps to, `None` for success.
///
/// 401 and 407 map to the authentication kinds; they only surface when
/// the retry loop gives up.
pub fn error_for_status(status: u16) -> Option<ErrorKind> {
    let kind = match status {
        0..=399 => return None,
        401 => ErrorKind::AuthenticationRequired,
        403 => ErrorKind::ContentAccessDenied,
        404 => ErrorKind::ContentNotFound,
        405 => ErrorKind::ContentOperationNotPermitted,
        407 => ErrorKind::ProxyAuthenticationRequired,
        409 => ErrorKind::ContentConflict,
        410 => ErrorKind::ContentGone,
        400..=499 => ErrorKind::UnknownContent,
        500 => ErrorKind::InternalServerError,
        501 => ErrorKind::OperationNotImplemented,
        503 => ErrorKind::ServiceUnavailable,
        _ => ErrorKind::UnknownServer,
    };
    Some(kind)
}
