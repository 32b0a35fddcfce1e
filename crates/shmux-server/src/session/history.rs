//! Bounded scrollback history for replay on join.
//!
//! Stores the trailing bytes of PTY output so that a client joining
//! mid-stream can receive a scrollback snapshot without the server keeping
//! unbounded history. Bytes are opaque; no ANSI awareness.

use std::collections::VecDeque;

/// A bounded byte log. Appends are amortized O(1); when capacity would be
/// exceeded the oldest bytes are discarded, preserving the newest suffix.
#[derive(Debug)]
pub struct HistoryBuffer {
    chunks: VecDeque<Vec<u8>>,
    size: usize,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    /// Append a chunk, trimming from the head so `len() <= capacity()`
    /// holds on return. A chunk larger than the whole capacity keeps only
    /// its last `capacity` bytes. Empty input is a no-op.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() || self.capacity == 0 {
            return;
        }

        if data.len() >= self.capacity {
            self.chunks.clear();
            self.chunks
                .push_back(data[data.len() - self.capacity..].to_vec());
            self.size = self.capacity;
            return;
        }

        self.chunks.push_back(data.to_vec());
        self.size += data.len();
        self.trim();
    }

    /// Drop or shorten head chunks until the size fits the capacity.
    fn trim(&mut self) {
        while self.size > self.capacity {
            let excess = self.size - self.capacity;
            let head_len = match self.chunks.front() {
                Some(head) => head.len(),
                None => break,
            };
            if head_len <= excess {
                self.chunks.pop_front();
                self.size -= head_len;
            } else {
                let head = self.chunks.front_mut().expect("front checked above");
                head.drain(..excess);
                self.size -= excess;
            }
        }
    }

    /// Copy out the buffered bytes in order. With `Some(limit)` (> 0),
    /// only the last `limit` bytes are returned.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<u8> {
        let want = match limit {
            Some(n) if n > 0 => n.min(self.size),
            _ => self.size,
        };
        let mut out = Vec::with_capacity(want);
        let mut skip = self.size - want;
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.extend_from_slice(&chunk[skip..]);
            skip = 0;
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}
