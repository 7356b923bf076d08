use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::attributes::RedirectPolicy;
use crate::error::Result;

/// Manager-wide defaults.
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes.
///
/// # Examples
///
/// ```
/// use tether::{ManagerConfig, RedirectPolicy};
///
/// let config = ManagerConfig::from_toml_str(
///     r#"
///     max_redirects = 5
///     redirect_policy = "same-origin"
///     "#,
/// )
/// .unwrap();
/// assert_eq!(config.max_redirects, 5);
/// assert_eq!(config.redirect_policy, RedirectPolicy::SameOrigin);
/// assert_eq!(config.progress_interval_ms, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Minimum spacing of progress events, first and last excepted.
    ///
    /// Default: 100
    pub progress_interval_ms: u64,

    /// How long an idle pooled connection is kept.
    ///
    /// Default: 120
    pub connection_ttl_secs: u64,

    /// Slack added to the expiry timer so close deadlines are swept together.
    ///
    /// Default: 10
    pub expiry_slack_ms: u64,

    /// Read buffer bound for new replies; 0 means unbounded.
    ///
    /// Default: 0
    pub read_buffer_size: usize,

    /// How much to pull from a backend at once when the buffer is unbounded.
    ///
    /// Default: 32768
    pub downstream_block_size: usize,

    /// Basic block size of ring buffers.
    ///
    /// Default: 4096
    pub ring_chunk_size: usize,

    /// Default: 50
    pub max_redirects: u32,

    /// Default: no-less-safe
    pub redirect_policy: RedirectPolicy,

    /// Default: false
    pub auto_delete_replies: bool,

    /// Transfer inactivity timeout; 0 disables.
    ///
    /// Default: 0
    pub transfer_timeout_ms: u64,

    /// Upgrade `http` to `https` for hosts with a live HSTS policy.
    ///
    /// Default: false
    pub strict_transport_security: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 100,
            connection_ttl_secs: 120,
            expiry_slack_ms: 10,
            read_buffer_size: 0,
            downstream_block_size: 32 * 1024,
            ring_chunk_size: 4096,
            max_redirects: 50,
            redirect_policy: RedirectPolicy::NoLessSafe,
            auto_delete_replies: false,
            transfer_timeout_ms: 0,
            strict_transport_security: false,
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl_secs = ttl.as_secs();
        self
    }

    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    #[must_use]
    pub fn redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.redirect_policy = policy;
        self
    }

    #[must_use]
    pub fn auto_delete_replies(mut self, enabled: bool) -> Self {
        self.auto_delete_replies = enabled;
        self
    }

    #[must_use]
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn strict_transport_security(mut self, enabled: bool) -> Self {
        self.strict_transport_security = enabled;
        self
    }

    pub fn progress_interval_duration(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn connection_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn expiry_slack(&self) -> Duration {
        Duration::from_millis(self.expiry_slack_ms)
    }

    /// `None` when the timeout is disabled.
    pub fn transfer_timeout_duration(&self) -> Option<Duration> {
        (self.transfer_timeout_ms > 0).then(|| Duration::from_millis(self.transfer_timeout_ms))
    }
}
