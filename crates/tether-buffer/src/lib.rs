//! Byte staging for request and reply bodies.
//!
//! - [`ByteRingBuffer`] - chunked queue with zero-copy read pointers
//! - [`UploadSource`] - caller-supplied request body
//! - [`UploadDevice`] - what backends pull upload bytes from

mod device;
mod ring;
mod upload;

pub use device::{ProgressDevice, RingBufferDevice, SourceDevice, UploadDevice};
pub use ring::{ByteRingBuffer, DEFAULT_CHUNK_SIZE};
pub use upload::{BytesSource, LocalWaker, SharedSource, SourceRead, UploadSource};
