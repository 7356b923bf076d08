//! Redirect policy checks.

use url::Url;

use crate::data::{Operation, RedirectPolicy};
use crate::error::ErrorKind;

/// Why a redirect may not be followed automatically, if it may not.
///
/// `Manual` and `UserVerified` never refuse here: the former is not
/// followed at all and the latter is up to the caller.
pub fn redirect_refusal(policy: RedirectPolicy, from: &Url, to: &Url) -> Option<ErrorKind> {
    match policy {
        RedirectPolicy::Manual | RedirectPolicy::UserVerified => None,
        RedirectPolicy::NoLessSafe => {
            (from.scheme() == "https" && to.scheme() == "http").then_some(ErrorKind::InsecureRedirect)
        }
        RedirectPolicy::SameOrigin => {
            (from.origin() != to.origin()).then_some(ErrorKind::InsecureRedirect)
        }
    }
}

/// Operation to use for the redirected request.
///
/// `303 See Other` always becomes `GET` (except for `HEAD`); `301` and
/// `302` turn a `POST` into a `GET`, as browsers do. `307` and `308`
/// keep the method and the body.
pub fn redirected_operation(operation: Operation, status: u16) -> Operation {
    match (status, operation) {
        (303, Operation::Head) => Operation::Head,
        (303, _) => Operation::Get,
        (301 | 302, Operation::Post) => Operation::Get,
        _ => operation,
    }
}
