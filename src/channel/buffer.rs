//! Receive buffer with earliest-match scanning.
//!
//! The buffer holds unconsumed bytes from the transport in arrival order.
//! Matches consume through their end; a timeout consumes nothing, so a caller
//! can always retry with the buffered bytes intact.

use bytes::{Buf, BytesMut};

use super::pattern::BoundedPattern;

/// A hit produced by [`ReceiveBuffer::find_earliest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hit {
    /// Index of the matching pattern in the candidate list.
    pub index: usize,
    /// Match start, relative to the buffer front.
    pub start: usize,
    /// Match end, relative to the buffer front.
    pub end: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ReceiveBuffer {
    data: BytesMut,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Remove and return the first `n` bytes.
    pub fn consume(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.split_to(n).to_vec()
    }

    /// Discard the first `n` bytes.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Remove and return everything.
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data).to_vec()
    }

    /// Find the earliest match of any candidate in `data[from..]`.
    ///
    /// Tie-break rule: the match with the smallest start position wins; for
    /// equal start positions the pattern listed first wins. This honors byte
    /// arrival order over candidate order.
    pub fn find_earliest<'a>(
        &self,
        patterns: impl IntoIterator<Item = &'a BoundedPattern>,
        from: usize,
    ) -> Option<Hit> {
        let from = from.min(self.data.len());
        let window = &self.data[from..];

        let mut best: Option<Hit> = None;
        for (index, pattern) in patterns.into_iter().enumerate() {
            if let Some((start, end)) = pattern.find(window) {
                let hit = Hit {
                    index,
                    start: start + from,
                    end: end + from,
                };
                // Strict comparison keeps the first-listed pattern on ties.
                if best.is_none_or(|b| hit.start < b.start) {
                    best = Some(hit);
                }
            }
        }
        best
    }
}
