//! Non-contiguous upload byte devices.
//!
//! Backends pull request bodies through [`UploadDevice`]: they ask for a
//! read pointer, send what they can, then advance. The device owns any
//! staging so the backend never copies more than it transmits.

use std::io;
use std::rc::Rc;

use tracing::trace;

use crate::ring::ByteRingBuffer;
use crate::upload::{LocalWaker, SharedSource, SourceRead};

pub trait UploadDevice {
    /// Contiguous bytes at the current position, at most `max_len` long.
    ///
    /// An empty slice with `at_end() == false` means the data is not
    /// available yet and the waker will fire later.
    fn read_pointer(&mut self, max_len: usize) -> io::Result<&[u8]>;

    fn advance_read_pointer(&mut self, amount: usize);

    fn at_end(&self) -> bool;

    fn size(&self) -> Option<u64>;

    /// Bytes consumed so far.
    fn pos(&self) -> u64;

    /// Rewind to the start. Returns `false` when the data cannot be replayed.
    fn reset(&mut self) -> bool;

    fn set_waker(&mut self, _waker: Option<LocalWaker>) {}
}

/// Device over a fully buffered body; always resettable.
#[derive(Debug, Clone)]
pub struct RingBufferDevice {
    buffer: Rc<ByteRingBuffer>,
    pos: usize,
}

impl RingBufferDevice {
    pub fn new(buffer: Rc<ByteRingBuffer>) -> Self {
        Self { buffer, pos: 0 }
    }
}

impl UploadDevice for RingBufferDevice {
    fn read_pointer(&mut self, max_len: usize) -> io::Result<&[u8]> {
        let data = self.buffer.read_pointer_at_position(self.pos);
        Ok(&data[..data.len().min(max_len)])
    }

    fn advance_read_pointer(&mut self, amount: usize) {
        self.pos = (self.pos + amount).min(self.buffer.len());
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buffer.len()
    }

    fn size(&self) -> Option<u64> {
        Some(self.buffer.len() as u64)
    }

    fn pos(&self) -> u64 {
        self.pos as u64
    }

    fn reset(&mut self) -> bool {
        self.pos = 0;
        true
    }
}

/// Device reading straight from an [`UploadSource`](crate::UploadSource),
/// staging one block at a time.
pub struct SourceDevice {
    source: SharedSource,
    staging: ByteRingBuffer,
    pos: u64,
    eof: bool,
}

impl SourceDevice {
    pub fn new(source: SharedSource, chunk_size: usize) -> Self {
        Self {
            source,
            staging: ByteRingBuffer::with_chunk_size(chunk_size),
            pos: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let want = self.staging.chunk_size();
        let dst = self.staging.reserve(want);
        let result = self.source.borrow_mut().read(dst);
        match result {
            Ok(SourceRead::Data(n)) => self.staging.chop(want - n.min(want)),
            Ok(SourceRead::Pending) => self.staging.chop(want),
            Ok(SourceRead::Eof) => {
                self.staging.chop(want);
                self.eof = true;
            }
            Err(e) => {
                self.staging.chop(want);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl UploadDevice for SourceDevice {
    fn read_pointer(&mut self, max_len: usize) -> io::Result<&[u8]> {
        if self.staging.is_empty() && !self.eof {
            self.fill()?;
        }
        let data = self.staging.read_pointer();
        Ok(&data[..data.len().min(max_len)])
    }

    fn advance_read_pointer(&mut self, amount: usize) {
        let amount = amount.min(self.staging.len());
        self.staging.free(amount);
        self.pos += amount as u64;
    }

    fn at_end(&self) -> bool {
        self.eof && self.staging.is_empty()
    }

    fn size(&self) -> Option<u64> {
        self.source.borrow().size()
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn reset(&mut self) -> bool {
        if !self.source.borrow_mut().reset() {
            return false;
        }
        self.staging.clear();
        self.pos = 0;
        self.eof = false;
        true
    }

    fn set_waker(&mut self, waker: Option<LocalWaker>) {
        self.source.borrow_mut().set_waker(waker);
    }
}

/// Reports every advance of the wrapped device to a callback.
pub struct ProgressDevice {
    inner: Box<dyn UploadDevice>,
    on_progress: Box<dyn FnMut(u64, Option<u64>)>,
}

impl ProgressDevice {
    pub fn new(
        inner: Box<dyn UploadDevice>,
        on_progress: impl FnMut(u64, Option<u64>) + 'static,
    ) -> Self {
        Self {
            inner,
            on_progress: Box::new(on_progress),
        }
    }
}

impl UploadDevice for ProgressDevice {
    fn read_pointer(&mut self, max_len: usize) -> io::Result<&[u8]> {
        self.inner.read_pointer(max_len)
    }

    fn advance_read_pointer(&mut self, amount: usize) {
        self.inner.advance_read_pointer(amount);
        let (pos, size) = (self.inner.pos(), self.inner.size());
        trace!(pos, ?size, "upload advanced");
        (self.on_progress)(pos, size);
    }

    fn at_end(&self) -> bool {
        self.inner.at_end()
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn pos(&self) -> u64 {
        self.inner.pos()
    }

    fn reset(&mut self) -> bool {
        self.inner.reset()
    }

    fn set_waker(&mut self, waker: Option<LocalWaker>) {
        self.inner.set_waker(waker);
    }
}
