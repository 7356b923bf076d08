//! Pure transformations used by the reply state machine.
//!
//! Nothing in this module performs I/O or touches the event loop; callers
//! pass in the clock where time matters.

mod cache_control;
mod cookie;
mod data_url;
mod progress;
mod redirect;
mod status;

pub use cache_control::CacheControl;
pub use cookie::{Cookie, cookie_header, default_path, domain_matches, path_matches};
pub use data_url::{DEFAULT_MEDIA_TYPE, DataUrl, decode_data_url};
pub use progress::ProgressChoke;
pub use redirect::{redirect_refusal, redirected_operation};
pub use status::{error_for_status, is_redirect};
