use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Where a request may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheLoadControl {
    /// Never consult the cache.
    AlwaysNetwork,
    /// Go to the network; the response may be saved.
    #[default]
    PreferNetwork,
    /// Serve a fresh cached entry when there is one.
    PreferCache,
    /// Only ever serve from the cache.
    AlwaysCache,
}

/// What to do when a backend reports a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectPolicy {
    /// Do not follow; the reply finishes with the redirect response and
    /// exposes the target as an attribute.
    Manual,
    /// Follow unless the redirect downgrades `https` to `http`.
    #[default]
    NoLessSafe,
    /// Follow only within the same scheme, host and port.
    SameOrigin,
    /// Pause and let the caller decide through `Reply::follow_redirect`.
    UserVerified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Whether cookies are handled by the manager or left to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CookieControl {
    #[default]
    Automatic,
    Manual,
}

/// Per-request options.
///
/// `None` fields fall back to the manager's configuration when the
/// request is dispatched.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tether::{CacheLoadControl, RedirectPolicy, RequestAttributes};
///
/// let attrs = RequestAttributes::default()
///     .redirect_policy(RedirectPolicy::SameOrigin)
///     .cache_load_control(CacheLoadControl::PreferCache)
///     .transfer_timeout(Duration::from_secs(30));
/// assert_eq!(attrs.max_redirects, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub cache_load_control: CacheLoadControl,
    /// Whether a response may be written to the cache. Default: true.
    pub cache_save_allowed: Option<bool>,
    pub redirect_policy: Option<RedirectPolicy>,
    pub max_redirects: Option<u32>,
    pub priority: Priority,
    /// Abort when no bytes move for this long. `Duration::ZERO` disables.
    pub transfer_timeout: Option<Duration>,
    /// Method name for custom operations.
    pub custom_verb: Option<String>,
    /// Dispose the reply on the next loop iteration after it finishes.
    pub auto_delete: Option<bool>,
    pub cookie_load: CookieControl,
    pub cookie_save: CookieControl,
    /// Run to completion inside dispatch when the backend supports it.
    pub synchronous: bool,
    /// Ask for the upload to be streamed rather than buffered.
    pub do_not_buffer_upload: bool,
    /// Emit every upload progress step instead of rate limiting them.
    pub emit_all_upload_progress: bool,
}

impl RequestAttributes {
    #[must_use]
    pub fn cache_load_control(mut self, control: CacheLoadControl) -> Self {
        self.cache_load_control = control;
        self
    }

    #[must_use]
    pub fn cache_save_allowed(mut self, allowed: bool) -> Self {
        self.cache_save_allowed = Some(allowed);
        self
    }

    #[must_use]
    pub fn redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.redirect_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = Some(max);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, enabled: bool) -> Self {
        self.auto_delete = Some(enabled);
        self
    }

    #[must_use]
    pub fn cookie_load(mut self, control: CookieControl) -> Self {
        self.cookie_load = control;
        self
    }

    #[must_use]
    pub fn cookie_save(mut self, control: CookieControl) -> Self {
        self.cookie_save = control;
        self
    }

    #[must_use]
    pub fn synchronous(mut self, enabled: bool) -> Self {
        self.synchronous = enabled;
        self
    }

    #[must_use]
    pub fn do_not_buffer_upload(mut self, enabled: bool) -> Self {
        self.do_not_buffer_upload = enabled;
        self
    }

    #[must_use]
    pub fn emit_all_upload_progress(mut self, enabled: bool) -> Self {
        self.emit_all_upload_progress = enabled;
        self
    }
}

/// Response-side attributes set by backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyAttributes {
    pub http_status: Option<u16>,
    pub reason_phrase: Option<String>,
    /// Target of the last redirect the backend reported.
    pub redirection_target: Option<Url>,
    pub source_is_from_cache: bool,
    pub connection_encrypted: bool,
}
