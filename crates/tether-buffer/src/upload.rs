//! Caller-supplied upload data sources.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use bytes::Bytes;

/// Callback invoked when a pending source has more data or reached its end.
pub type LocalWaker = Rc<dyn Fn()>;

/// An upload source shared between the caller and the reply that drains it.
pub type SharedSource = Rc<RefCell<dyn UploadSource>>;

/// Outcome of a single [`UploadSource::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRead {
    /// This many bytes were written into the buffer.
    Data(usize),
    /// Nothing available right now; the waker fires when that changes.
    Pending,
    /// No more data will ever be produced.
    Eof,
}

/// A stream of outgoing request body bytes.
///
/// Random-access sources report `is_sequential() == false` and can be
/// rewound with [`reset`](UploadSource::reset), which lets the body be
/// replayed after a redirect or an authentication retry. Sequential
/// sources without a known size are staged in a ring buffer before the
/// transfer starts when the backend needs to replay them.
pub trait UploadSource {
    fn is_sequential(&self) -> bool;

    /// Total size, when known up front.
    fn size(&self) -> Option<u64>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<SourceRead>;

    /// Rewind to the first byte. Returns `false` when the source cannot.
    fn reset(&mut self) -> bool {
        false
    }

    fn set_waker(&mut self, _waker: Option<LocalWaker>) {}
}

/// In-memory upload body.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
    pos: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }

    /// Wrap into the shared form accepted by request methods.
    pub fn shared(data: impl Into<Bytes>) -> SharedSource {
        Rc::new(RefCell::new(Self::new(data)))
    }
}

impl UploadSource for BytesSource {
    fn is_sequential(&self) -> bool {
        false
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<SourceRead> {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Ok(SourceRead::Eof);
        }
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(SourceRead::Data(n))
    }

    fn reset(&mut self) -> bool {
        self.pos = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_source_reads_then_eof() {
        let mut source = BytesSource::new(&b"payload"[..]);
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), SourceRead::Data(4));
        assert_eq!(&buf, b"payl");
        assert_eq!(source.read(&mut buf).unwrap(), SourceRead::Data(3));
        assert_eq!(source.read(&mut buf).unwrap(), SourceRead::Eof);
    }

    #[test]
    fn test_bytes_source_reset() {
        let mut source = BytesSource::new(&b"ab"[..]);
        let mut buf = [0u8; 8];
        source.read(&mut buf).unwrap();
        assert!(source.reset());
        assert_eq!(source.read(&mut buf).unwrap(), SourceRead::Data(2));
        assert!(!source.is_sequential());
        assert_eq!(source.size(), Some(2));
    }
}
