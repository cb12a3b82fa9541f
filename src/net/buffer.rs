use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// Ordered chunks waiting to be accepted by the OS.
///
/// Chunks are shared `Bytes` handles, so queueing never copies payload.
/// Bytes leave from the front as sends complete; a partially sent chunk
/// keeps its unsent tail at the front.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.size += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Total unsent bytes across all chunks.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Drops `n` sent bytes from the front, splitting a chunk if needed.
    ///
    /// Returns how many bytes were actually removed, which is less than `n`
    /// only when the buffer ran dry.
    pub fn consume(&mut self, mut n: usize) -> usize {
        let mut removed = 0;
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if n < front.len() {
                front.advance(n);
                removed += n;
                break;
            }
            n -= front.len();
            removed += front.len();
            self.chunks.pop_front();
        }
        self.size -= removed;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}
