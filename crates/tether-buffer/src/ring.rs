//! Chunked byte queue used to stage upload and download data.
//!
//! The buffer is an ordered sequence of chunks. Chunks are either uniquely
//! owned (`BytesMut`, writable in place) or shared (`Bytes`, handed in by a
//! producer and never copied). Consumption only moves a per-chunk head
//! offset until a chunk is exhausted, at which point it is dropped.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Default basic block size used when growing the tail.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
enum Storage {
    Owned(BytesMut),
    Shared(Bytes),
}

#[derive(Debug)]
struct Chunk {
    storage: Storage,
    head: usize,
}

impl Chunk {
    fn owned(capacity: usize) -> Self {
        Self {
            storage: Storage::Owned(BytesMut::with_capacity(capacity)),
            head: 0,
        }
    }

    fn shared(bytes: Bytes) -> Self {
        Self {
            storage: Storage::Shared(bytes),
            head: 0,
        }
    }

    fn end(&self) -> usize {
        match &self.storage {
            Storage::Owned(b) => b.len(),
            Storage::Shared(b) => b.len(),
        }
    }

    fn len(&self) -> usize {
        self.end() - self.head
    }

    fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(b) => &b[self.head..],
            Storage::Shared(b) => &b[self.head..],
        }
    }

    /// Writable room after the last byte, zero for shared chunks.
    fn spare(&self) -> usize {
        match &self.storage {
            Storage::Owned(b) => b.capacity() - b.len(),
            Storage::Shared(_) => 0,
        }
    }

    fn truncate_tail(&mut self, amount: usize) {
        let new_end = self.end() - amount;
        match &mut self.storage {
            Storage::Owned(b) => b.truncate(new_end),
            Storage::Shared(b) => b.truncate(new_end),
        }
    }

    fn is_recyclable(&self, chunk_size: usize) -> bool {
        matches!(&self.storage, Storage::Owned(b) if b.capacity() <= chunk_size)
    }

    fn recycle(&mut self) {
        if let Storage::Owned(b) = &mut self.storage {
            b.clear();
        }
        self.head = 0;
    }
}

/// A chunked, copy-avoiding byte queue.
///
/// `len()` always equals the number of unconsumed bytes across all chunks.
/// After draining, one small owned chunk is retained so the next write does
/// not have to allocate.
#[derive(Debug)]
pub struct ByteRingBuffer {
    chunks: VecDeque<Chunk>,
    size: usize,
    chunk_size: usize,
}

impl Default for ByteRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteRingBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Size of the contiguous block at the read position.
    pub fn next_data_block_size(&self) -> usize {
        self.chunks.front().map_or(0, Chunk::len)
    }

    /// Zero-copy view of the first contiguous block.
    ///
    /// The view must not be held across any mutating call.
    pub fn read_pointer(&self) -> &[u8] {
        self.chunks.front().map_or(&[][..], Chunk::as_slice)
    }

    /// Contiguous view starting at absolute offset `pos`, empty past the end.
    pub fn read_pointer_at_position(&self, mut pos: usize) -> &[u8] {
        for chunk in &self.chunks {
            let len = chunk.len();
            if pos < len {
                return &chunk.as_slice()[pos..];
            }
            pos -= len;
        }
        &[]
    }

    /// Discard `amount` bytes from the head without copying.
    pub fn free(&mut self, mut amount: usize) {
        amount = amount.min(self.size);
        self.size -= amount;
        while amount > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let len = front.len();
            if amount < len {
                front.head += amount;
                break;
            }
            amount -= len;
            self.pop_front();
        }
        self.drop_empty_front();
    }

    /// Discard `amount` bytes from the tail without copying.
    pub fn chop(&mut self, mut amount: usize) {
        amount = amount.min(self.size);
        self.size -= amount;
        while amount > 0 {
            let Some(back) = self.chunks.back_mut() else {
                break;
            };
            let len = back.len();
            if amount < len {
                back.truncate_tail(amount);
                break;
            }
            amount -= len;
            let Some(chunk) = self.chunks.pop_back() else {
                break;
            };
            if self.chunks.is_empty() {
                self.retain_if_last(chunk);
                break;
            }
        }
        if self.chunks.len() > 1 {
            self.chunks.retain(|c| c.len() > 0);
        }
    }

    pub fn clear(&mut self) {
        let last = self.chunks.drain(..).last();
        if let Some(chunk) = last {
            self.retain_if_last(chunk);
        }
        self.size = 0;
    }

    /// Writable space for `amount` bytes at the tail.
    ///
    /// The last chunk is grown in place when it is uniquely owned and has
    /// room; otherwise a chunk of at least the basic block size is added.
    /// Callers that write fewer bytes must `chop` the remainder.
    pub fn reserve(&mut self, amount: usize) -> &mut [u8] {
        if amount == 0 {
            return &mut [];
        }
        let fits = self.chunks.back().is_some_and(|c| c.spare() >= amount);
        if !fits {
            if self.chunks.back().is_some_and(|c| c.len() == 0) {
                self.chunks.pop_back();
            }
            self.chunks
                .push_back(Chunk::owned(amount.max(self.chunk_size)));
        }
        self.size += amount;
        let Some(Chunk {
            storage: Storage::Owned(buf),
            ..
        }) = self.chunks.back_mut()
        else {
            return &mut [];
        };
        let start = buf.len();
        buf.resize(start + amount, 0);
        &mut buf[start..]
    }

    /// Writable space for `amount` bytes in front of the read position.
    pub fn reserve_front(&mut self, amount: usize) -> &mut [u8] {
        if amount == 0 {
            return &mut [];
        }
        let fits = self.chunks.front().is_some_and(|c| {
            matches!(c.storage, Storage::Owned(_)) && c.head >= amount
        });
        if !fits {
            if self.chunks.front().is_some_and(|c| c.len() == 0) {
                self.chunks.pop_front();
            }
            let capacity = amount.max(self.chunk_size);
            let mut buf = BytesMut::with_capacity(capacity);
            buf.resize(capacity, 0);
            self.chunks.push_front(Chunk {
                storage: Storage::Owned(buf),
                head: capacity,
            });
        }
        self.size += amount;
        let Some(front) = self.chunks.front_mut() else {
            return &mut [];
        };
        front.head -= amount;
        let head = front.head;
        match &mut front.storage {
            Storage::Owned(buf) => &mut buf[head..head + amount],
            Storage::Shared(_) => &mut [],
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len()).copy_from_slice(data);
    }

    /// Append a shared buffer, copying only when it fits in the tail's spare room.
    pub fn append_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let fits = self.chunks.back().is_some_and(|c| c.spare() >= data.len());
        if fits {
            self.append(&data);
            return;
        }
        if self.chunks.back().is_some_and(|c| c.len() == 0) {
            self.chunks.pop_back();
        }
        self.size += data.len();
        self.chunks.push_back(Chunk::shared(data));
    }

    /// Append an owned buffer as its own chunk.
    pub fn append_owned(&mut self, data: BytesMut) {
        if data.is_empty() {
            return;
        }
        if self.chunks.back().is_some_and(|c| c.len() == 0) {
            self.chunks.pop_back();
        }
        self.size += data.len();
        self.chunks.push_back(Chunk {
            storage: Storage::Owned(data),
            head: 0,
        });
    }

    pub fn put_byte(&mut self, byte: u8) {
        self.reserve(1)[0] = byte;
    }

    pub fn get_byte(&mut self) -> Option<u8> {
        let byte = *self.read_pointer().first()?;
        self.free(1);
        Some(byte)
    }

    /// Push a byte back in front of the read position.
    pub fn unget_byte(&mut self, byte: u8) {
        self.reserve_front(1)[0] = byte;
    }

    /// Copy up to `dst.len()` bytes out, consuming them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let copied = self.peek(dst, 0);
        self.free(copied);
        copied
    }

    /// Consume up to `max_len` bytes; a shared front chunk is sliced, not copied.
    pub fn read_bytes(&mut self, max_len: usize) -> Bytes {
        let amount = max_len.min(self.size);
        if amount == 0 {
            return Bytes::new();
        }
        if let Some(Chunk {
            storage: Storage::Shared(bytes),
            head,
        }) = self.chunks.front()
        {
            if bytes.len() - head >= amount {
                let slice = bytes.slice(*head..*head + amount);
                self.free(amount);
                return slice;
            }
        }
        let mut out = BytesMut::zeroed(amount);
        self.read(&mut out);
        out.freeze()
    }

    pub fn read_all(&mut self) -> Bytes {
        self.read_bytes(self.size)
    }

    /// Copy bytes starting at `pos` without consuming them.
    pub fn peek(&self, dst: &mut [u8], mut pos: usize) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == dst.len() {
                break;
            }
            let data = chunk.as_slice();
            if pos >= data.len() {
                pos -= data.len();
                continue;
            }
            let data = &data[pos..];
            pos = 0;
            let n = data.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&data[..n]);
            copied += n;
        }
        copied
    }

    /// Absolute offset of `byte` within `[pos, pos + max_len)`.
    pub fn index_of(&self, byte: u8, max_len: usize, pos: usize) -> Option<usize> {
        let end = pos.saturating_add(max_len).min(self.size);
        if pos >= end {
            return None;
        }
        let mut offset = 0;
        for chunk in &self.chunks {
            let data = chunk.as_slice();
            let chunk_end = offset + data.len();
            if chunk_end > pos {
                let from = pos.saturating_sub(offset);
                let to = (end - offset).min(data.len());
                if let Some(i) = data[from..to].iter().position(|&b| b == byte) {
                    return Some(offset + from + i);
                }
            }
            offset = chunk_end;
            if offset >= end {
                break;
            }
        }
        None
    }

    pub fn can_read_line(&self) -> bool {
        self.index_of(b'\n', self.size, 0).is_some()
    }

    /// Consume one line including its terminator, at most `max_len` bytes.
    pub fn read_line(&mut self, max_len: usize) -> Bytes {
        let amount = match self.index_of(b'\n', max_len, 0) {
            Some(i) => i + 1,
            None => max_len.min(self.size),
        };
        self.read_bytes(amount)
    }

    /// Panics if the size accounting or chunk layout is inconsistent.
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let total: usize = self.chunks.iter().map(Chunk::len).sum();
        assert_eq!(total, self.size, "size does not match chunk contents");
        if self.chunks.len() > 1 {
            assert!(
                self.chunks.iter().all(|c| c.len() > 0),
                "empty chunk alongside data chunks"
            );
        }
    }

    fn pop_front(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            self.retain_if_last(chunk);
        }
    }

    fn drop_empty_front(&mut self) {
        if self.chunks.len() > 1 && self.chunks.front().is_some_and(|c| c.len() == 0) {
            self.chunks.pop_front();
        }
    }

    fn retain_if_last(&mut self, mut chunk: Chunk) {
        if self.chunks.is_empty() && chunk.is_recyclable(self.chunk_size) {
            chunk.recycle();
            self.chunks.push_back(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_across_chunks() {
        let mut buf = ByteRingBuffer::with_chunk_size(4);
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.len(), 11);

        let mut out = [0u8; 11];
        assert_eq!(buf.read(&mut out), 11);
        assert_eq!(&out, b"hello world");
        assert!(buf.is_empty());
        buf.debug_validate_invariants();
    }

    #[test]
    fn test_read_truncates_to_available() {
        let mut buf = ByteRingBuffer::new();
        buf.append(b"abc");
        let mut out = [0u8; 16];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn test_free_and_chop() {
        let mut buf = ByteRingBuffer::with_chunk_size(3);
        buf.append(b"abc");
        buf.append_bytes(Bytes::from_static(b"defgh"));
        buf.free(2);
        buf.chop(3);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.read_all(), Bytes::from_static(b"cde"));
        buf.debug_validate_invariants();
    }

    #[test]
    fn test_reserve_then_chop_unused() {
        let mut buf = ByteRingBuffer::new();
        let dst = buf.reserve(8);
        dst[..3].copy_from_slice(b"xyz");
        buf.chop(5);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.read_pointer(), b"xyz");
    }

    #[test]
    fn test_small_chunk_retained_after_drain() {
        let mut buf = ByteRingBuffer::with_chunk_size(16);
        buf.append(b"data");
        buf.free(4);
        assert!(buf.is_empty());
        assert_eq!(buf.chunks.len(), 1);
        buf.debug_validate_invariants();

        buf.append(b"again");
        assert_eq!(buf.chunks.len(), 1);
        assert_eq!(buf.read_all(), Bytes::from_static(b"again"));
    }

    #[test]
    fn test_shared_chunk_not_grown_in_place() {
        let mut buf = ByteRingBuffer::new();
        buf.append_bytes(Bytes::from(vec![1u8; 8192]));
        buf.append(b"z");
        assert_eq!(buf.chunks.len(), 2);
        assert_eq!(buf.len(), 8193);
    }

    #[test]
    fn test_read_bytes_zero_copy_for_shared_front() {
        let source = Bytes::from(vec![7u8; 10000]);
        let mut buf = ByteRingBuffer::new();
        buf.append_bytes(source.clone());
        let part = buf.read_bytes(100);
        assert_eq!(part.as_ptr(), source.as_ptr());
        assert_eq!(buf.len(), 9900);
    }

    #[test]
    fn test_unget_byte() {
        let mut buf = ByteRingBuffer::new();
        buf.append(b"bc");
        assert_eq!(buf.get_byte(), Some(b'b'));
        buf.unget_byte(b'a');
        assert_eq!(buf.read_all(), Bytes::from_static(b"ac"));
        assert_eq!(buf.get_byte(), None);
    }

    #[test]
    fn test_unget_into_empty_buffer() {
        let mut buf = ByteRingBuffer::new();
        buf.unget_byte(b'q');
        buf.append(b"r");
        assert_eq!(buf.read_all(), Bytes::from_static(b"qr"));
    }

    #[test]
    fn test_index_of_across_chunk_boundaries() {
        let mut buf = ByteRingBuffer::with_chunk_size(2);
        buf.append_bytes(Bytes::from_static(b"ab"));
        buf.append_bytes(Bytes::from_static(b"cd\nef"));
        assert_eq!(buf.index_of(b'\n', usize::MAX, 0), Some(4));
        assert_eq!(buf.index_of(b'\n', 4, 0), None);
        assert_eq!(buf.index_of(b'c', 10, 3), None);
        assert_eq!(buf.index_of(b'e', 10, 3), Some(5));
    }

    #[test]
    fn test_read_line() {
        let mut buf = ByteRingBuffer::new();
        buf.append(b"first\nsecond");
        assert!(buf.can_read_line());
        assert_eq!(buf.read_line(usize::MAX), Bytes::from_static(b"first\n"));
        assert!(!buf.can_read_line());
        assert_eq!(buf.read_line(3), Bytes::from_static(b"sec"));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = ByteRingBuffer::with_chunk_size(3);
        buf.append(b"abc");
        buf.append_bytes(Bytes::from_static(b"defg"));
        let mut out = [0u8; 4];
        assert_eq!(buf.peek(&mut out, 2), 4);
        assert_eq!(&out, b"cdef");
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.read_pointer_at_position(4), b"efg");
        assert_eq!(buf.read_pointer_at_position(7), b"");
    }

    #[test]
    fn test_clear() {
        let mut buf = ByteRingBuffer::new();
        buf.append(b"abc");
        buf.append_bytes(Bytes::from(vec![0u8; 5000]));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.next_data_block_size(), 0);
        buf.debug_validate_invariants();
    }

    #[test]
    fn test_clear_keeps_one_small_owned_chunk() {
        let mut buf = ByteRingBuffer::new();
        buf.append(b"abc");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.read_pointer(), b"");
        buf.debug_validate_invariants();

        buf.append(b"again");
        buf.clear();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(&buf.read_all()[..], b"");
    }

    #[test]
    fn test_chop_everything_from_single_chunk() {
        let mut buf = ByteRingBuffer::with_chunk_size(8);
        buf.append(b"abcd");
        buf.chop(4);
        assert!(buf.is_empty());
        buf.append(b"xy");
        assert_eq!(&buf.read_all()[..], b"xy");
        buf.debug_validate_invariants();
    }
}
