use std::collections::VecDeque;

use bytes::Bytes;

/// Bounded ring buffer of raw output chunks.
///
/// Holds container output produced while no client is attached, so a
/// resume can replay what was missed. Once the byte cap is exceeded the
/// oldest chunks are evicted, trading completeness of replay for
/// bounded memory.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append a chunk, evicting from the front until within the cap.
    /// A single chunk larger than the cap evicts everything else and is
    /// kept whole.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.total_bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.total_bytes -= evicted.len();
            }
        }
    }

    /// Take all buffered chunks in insertion order, leaving the buffer
    /// empty.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.total_bytes = 0;
        self.chunks.drain(..).collect()
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let mut buf = OutputBuffer::new(1024);
        buf.push(Bytes::from_static(b"one"));
        buf.push(Bytes::from_static(b"two"));
        let drained = buf.drain();
        assert_eq!(drained, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn evicts_oldest_when_over_cap() {
        let mut buf = OutputBuffer::new(8);
        buf.push(Bytes::from_static(b"aaaa"));
        buf.push(Bytes::from_static(b"bbbb"));
        buf.push(Bytes::from_static(b"cc"));
        // "aaaa" evicted to make room.
        assert_eq!(buf.len_bytes(), 6);
        let drained = buf.drain();
        assert_eq!(drained, vec![Bytes::from_static(b"bbbb"), Bytes::from_static(b"cc")]);
    }

    #[test]
    fn oversized_single_chunk_is_kept_whole() {
        let mut buf = OutputBuffer::new(4);
        buf.push(Bytes::from_static(b"small"));
        buf.push(Bytes::from_static(b"this chunk is larger than the cap"));
        let drained = buf.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0], Bytes::from_static(b"this chunk is larger than the cap"));
    }

    #[test]
    fn ignores_empty_chunks() {
        let mut buf = OutputBuffer::new(16);
        buf.push(Bytes::new());
        assert!(buf.is_empty());
    }
}
