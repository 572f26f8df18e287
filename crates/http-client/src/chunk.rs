//! ChunkQueue: singly-linked FIFO of inline-payload buffers, relinked
//! (never copied) between queues. This is a client-local copy,
//! independent of `http3_server::shared::ChunkQueue` since neither
//! subsystem depends on the other.

use std::collections::VecDeque;

#[derive(Clone)]
struct Chunk {
    payload: bytes::Bytes,
    off: usize,
}

impl Chunk {
    fn len(&self) -> usize {
        self.payload.len() - self.off
    }

    fn as_slice(&self) -> &[u8] {
        &self.payload[self.off..]
    }
}

/// FIFO of byte chunks used to stage a request body (from memory) and to
/// accumulate a response body before it is handed to its final sink.
/// `unread` always equals the sum of the lengths of the chunks still
/// queued.
#[derive(Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    unread: usize,
    drained: u64,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, payload: bytes::Bytes) {
        if payload.is_empty() {
            return;
        }
        self.unread += payload.len();
        self.chunks.push_back(Chunk { payload, off: 0 });
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn drained(&self) -> u64 {
        self.drained
    }

    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    /// Relinks whole chunks from `self`'s head to `dst`'s tail until `max`
    /// bytes would be exceeded; a chunk straddling the boundary is left
    /// behind rather than split.
    pub fn move_to(&mut self, dst: &mut ChunkQueue, max: usize) -> usize {
        let mut moved = 0;
        while let Some(front) = self.chunks.front() {
            if moved + front.len() > max {
                break;
            }
            let chunk = self.chunks.pop_front().expect("front just checked");
            moved += chunk.len();
            self.unread -= chunk.len();
            dst.unread += chunk.len();
            dst.chunks.push_back(chunk);
        }
        moved
    }

    /// Removes exactly `min(n, unread)` bytes from the head.
    pub fn trim(&mut self, n: usize, drain: bool) -> usize {
        let mut remaining = n.min(self.unread);
        let trimmed = remaining;
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("unread tracks chunk lengths");
            let take = remaining.min(front.len());
            front.off += take;
            remaining -= take;
            self.unread -= take;
            if front.len() == 0 {
                self.chunks.pop_front();
            }
        }
        if drain {
            self.drained += trimmed as u64;
        }
        trimmed
    }

    pub fn clear(&mut self) {
        self.unread = 0;
        self.chunks.clear();
    }

    /// Copies out up to the first `cap` bytes without trimming, for a
    /// caller that needs a contiguous view (e.g. the chunked codec probing
    /// ahead for a terminator).
    pub fn peek(&self, cap: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(cap.min(self.unread));
        for chunk in &self.chunks {
            if out.len() >= cap {
                break;
            }
            let take = (cap - out.len()).min(chunk.len());
            out.extend_from_slice(&chunk.as_slice()[..take]);
        }
        out
    }

    /// Drains the whole queue into one contiguous buffer (used once a
    /// response is fully received and its sink is an in-memory buffer).
    pub fn drain_to_vec(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.unread);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(chunk.as_slice());
        }
        self.drained += self.unread as u64;
        self.unread = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariants_hold_across_enqueue_trim() {
        let mut q = ChunkQueue::new();
        assert!(q.is_empty());
        q.enqueue(bytes::Bytes::from_static(b"hello"));
        q.enqueue(bytes::Bytes::from_static(b"world"));
        assert_eq!(q.unread(), 10);
        assert_eq!(q.trim(3, true), 3);
        assert_eq!(q.unread(), 7);
        assert_eq!(q.drained(), 3);
    }

    #[test]
    fn move_to_leaves_straddling_chunk_behind() {
        let mut src = ChunkQueue::new();
        src.enqueue(bytes::Bytes::from_static(b"abc"));
        src.enqueue(bytes::Bytes::from_static(b"defgh"));
        let mut dst = ChunkQueue::new();
        let moved = src.move_to(&mut dst, 4);
        assert_eq!(moved, 3);
        assert_eq!(src.unread(), 5);
        assert_eq!(dst.unread(), 3);
    }

    #[test]
    fn drain_to_vec_concatenates_in_order() {
        let mut q = ChunkQueue::new();
        q.enqueue(bytes::Bytes::from_static(b"ab"));
        q.enqueue(bytes::Bytes::from_static(b"cd"));
        assert_eq!(q.drain_to_vec(), b"abcd");
        assert!(q.is_empty());
    }
}
