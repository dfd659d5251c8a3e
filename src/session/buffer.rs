//! Utterance audio buffer

/// Result of appending a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Fragment stored, room remains
    Accepted,
    /// Fragment stored and the byte cap has been reached
    Full,
}

/// Ordered sequence of inbound audio fragments for one utterance
///
/// Fragments are kept in arrival order and concatenated on [`take`](Self::take).
/// Once the total reaches `max_bytes` the buffer reports [`BufferStatus::Full`]
/// so the owner can finalize the utterance early.
#[derive(Debug)]
pub struct AudioBuffer {
    fragments: Vec<Vec<u8>>,
    len: usize,
    max_bytes: usize,
}

impl AudioBuffer {
    /// Create an empty buffer with the given byte cap
    #[must_use]
    pub const fn new(max_bytes: usize) -> Self {
        Self {
            fragments: Vec::new(),
            len: 0,
            max_bytes,
        }
    }

    /// Append a fragment; empty fragments are ignored
    pub fn push(&mut self, fragment: Vec<u8>) -> BufferStatus {
        if !fragment.is_empty() {
            self.len += fragment.len();
            self.fragments.push(fragment);
        }

        if self.len >= self.max_bytes {
            BufferStatus::Full
        } else {
            BufferStatus::Accepted
        }
    }

    /// Concatenate all fragments in insertion order and clear the buffer
    pub fn take(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for fragment in self.fragments.drain(..) {
            out.extend_from_slice(&fragment);
        }
        self.len = 0;
        out
    }

    /// Drop all buffered audio
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.len = 0;
    }

    /// Total buffered bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of stored fragments
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Configured byte cap
    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
