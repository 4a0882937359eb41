//! The ordered list of byte views queued for one socket write.
//!
//! Every element is a [`Bytes`], so a buffer either shares storage with the
//! object it was cut from (a pre-body field, a trailer, the connection read
//! buffer) or owns bytes that were synthesized for it. Both kinds stay alive
//! until the write that consumes them completes.

use bytes::{Bytes, BytesMut};
use std::vec;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingBuffers {
    buffers: Vec<Bytes>,
}

impl OutgoingBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `bytes`; empty views are dropped so that [`Self::is_empty`] means "nothing to write".
    pub fn push(&mut self, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        if !bytes.is_empty() {
            self.buffers.push(bytes);
        }
    }

    pub fn push_static(&mut self, bytes: &'static [u8]) {
        self.push(Bytes::from_static(bytes));
    }

    /// Moves every buffer of `other` to the end of this list.
    pub fn append(&mut self, other: &mut OutgoingBuffers) {
        self.buffers.append(&mut other.buffers);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of queued views.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Total number of queued bytes.
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Takes every queued buffer out, leaving this list empty.
    pub fn take(&mut self) -> OutgoingBuffers {
        std::mem::take(self)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.buffers.iter()
    }

    /// Copies every view into one contiguous buffer.
    pub fn concat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.total_len());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer);
        }
        out.freeze()
    }
}

impl<B: Into<Bytes>> Extend<B> for OutgoingBuffers {
    fn extend<T: IntoIterator<Item = B>>(&mut self, iter: T) {
        for bytes in iter {
            self.push(bytes);
        }
    }
}

impl<B: Into<Bytes>> FromIterator<B> for OutgoingBuffers {
    fn from_iter<T: IntoIterator<Item = B>>(iter: T) -> Self {
        let mut buffers = Self::new();
        buffers.extend(iter);
        buffers
    }
}

impl IntoIterator for OutgoingBuffers {
    type Item = Bytes;
    type IntoIter = vec::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}

impl<'a> IntoIterator for &'a OutgoingBuffers {
    type Item = &'a Bytes;
    type IntoIter = std::slice::Iter<'a, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.iter()
    }
}
