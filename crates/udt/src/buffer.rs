use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::{BufMut, Bytes, BytesMut};

/// Immutable, reference-counted byte string with zero-copy slicing.
///
/// A `ByteBuffer` is a view `(offset, len)` into a shared backing allocation.
/// Views never write to the backing store, so any number of them may share one
/// allocation across threads. The allocation is released when the last view
/// referencing it is dropped or cleared.
///
/// None of the operations fail: requests that fall outside the view degrade
/// to an empty buffer, and an empty buffer holds no allocation at all.
#[derive(Clone, Default)]
pub struct ByteBuffer {
    backing: Bytes,
    offset: usize,
    len: usize,
}

/// Writable handle returned by [`ByteBuffer::create`].
///
/// The handle owns its bytes exclusively until [`freeze`](Self::freeze) turns
/// it into a shareable `ByteBuffer` over the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteBufferMut {
    bytes: BytesMut,
}

impl ByteBufferMut {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn freeze(self) -> ByteBuffer {
        ByteBuffer::from(self.bytes.freeze())
    }
}

impl Deref for ByteBufferMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for ByteBufferMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl ByteBuffer {
    pub const fn new() -> Self {
        Self {
            backing: Bytes::new(),
            offset: 0,
            len: 0,
        }
    }

    /// Allocates a zeroed backing store of `len` bytes for the caller to fill.
    pub fn create(len: usize) -> ByteBufferMut {
        ByteBufferMut {
            bytes: BytesMut::zeroed(len),
        }
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops this view's reference to the backing store. Other views are unaffected.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.backing[self.offset..self.offset + self.len]
    }

    /// The viewed bytes as a `Bytes` handle on the same allocation.
    pub fn to_bytes(&self) -> Bytes {
        self.backing.slice(self.offset..self.offset + self.len)
    }

    /// Removes and returns the first byte, or `0` if the view is empty.
    pub fn pop_front(&mut self) -> u8 {
        let Some(&first) = self.as_slice().first() else {
            return 0;
        };

        self.offset += 1;
        self.len -= 1;
        if self.len == 0 {
            self.clear();
        }

        first
    }

    /// Zero-copy view of `len` bytes starting at `offset`.
    ///
    /// `len` is clamped to what remains after `offset`; `None` means "to the end".
    /// An `offset` at or past the end yields an empty buffer.
    pub fn substring(&self, offset: usize, len: Option<usize>) -> Self {
        if offset >= self.len {
            return Self::new();
        }

        let available = self.len - offset;
        let len = len.map_or(available, |len| len.min(available));
        if len == 0 {
            return Self::new();
        }

        Self {
            backing: self.backing.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// Joins two buffers.
    ///
    /// When `other` starts exactly where `self` ends inside the same backing
    /// allocation the result is a wider view of that allocation. Otherwise the
    /// bytes of both are copied once into a new allocation.
    pub fn concat(&self, other: &ByteBuffer) -> Self {
        Self::join([self, other])
    }

    /// Joins any number of buffers, in order, with the same rule as
    /// [`concat`](Self::concat): a chain of adjacent views of one allocation
    /// widens into a single view, anything else is copied into one new
    /// allocation sized up front.
    pub fn join<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a ByteBuffer>,
    {
        let parts: Vec<&ByteBuffer> = parts.into_iter().filter(|p| !p.is_empty()).collect();

        let (first, rest) = match parts.split_first() {
            None => return Self::new(),
            Some((first, [])) => return (*first).clone(),
            Some(split) => split,
        };

        let mut end = first.offset + first.len;
        let contiguous = rest.iter().all(|part| {
            let adjacent = part.shares_backing_with(first) && part.offset == end;
            end = part.offset + part.len;
            adjacent
        });
        let total: usize = parts.iter().map(|p| p.len).sum();

        if contiguous {
            return Self {
                backing: first.backing.clone(),
                offset: first.offset,
                len: total,
            };
        }

        let mut joined = BytesMut::with_capacity(total);
        for part in &parts {
            joined.put_slice(part.as_slice());
        }
        Self::from(joined.freeze())
    }

    /// True when both views reference the same backing allocation.
    pub fn shares_backing_with(&self, other: &ByteBuffer) -> bool {
        !self.backing.is_empty()
            && self.backing.as_ptr() == other.backing.as_ptr()
            && self.backing.len() == other.backing.len()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::new();
        }

        let len = bytes.len();
        Self {
            backing: bytes,
            offset: 0,
            len,
        }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(data: &[u8]) -> Self {
        Self::copy_from_slice(data)
    }
}

impl From<&str> for ByteBuffer {
    fn from(data: &str) -> Self {
        Self::copy_from_slice(data.as_bytes())
    }
}

impl From<ByteBufferMut> for ByteBuffer {
    fn from(buffer: ByteBufferMut) -> Self {
        buffer.freeze()
    }
}

impl From<ByteBuffer> for Bytes {
    fn from(buffer: ByteBuffer) -> Self {
        buffer.to_bytes()
    }
}

impl Deref for ByteBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ByteBuffer {}

impl PartialEq<[u8]> for ByteBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl PartialEq<&[u8]> for ByteBuffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_slice() == *other
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("bytes", &self.as_slice())
            .finish()
    }
}
