//! Cross-thread body submission and resume signaling for the HTTP/3 driver.
//!
//! Application threads (producers) only ever call `enqueue_body`,
//! `mark_closed_by_app`, `hdrs_set_ready` and `request_resume`; the driver
//! thread (consumer) calls everything else. Locks are never held across
//! protocol I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An immutable-size byte buffer queued for transfer. Chunks move between
/// queues by relink only; `ChunkQueue::move_to` never copies payload bytes.
#[derive(Clone)]
struct Chunk {
    payload: bytes::Bytes,
    /// Offset of the first unconsumed byte within `payload`.
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

/// Singly-linked FIFO of [`Chunk`]s. `unread` always equals the sum of the
/// lengths of the chunks still queued.
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

    /// Copies `payload` into a freshly queued chunk at the tail.
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
    /// bytes would be exceeded. The chunk straddling the boundary is only
    /// moved if it fits entirely; a partially-fitting chunk is left behind.
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

    /// Removes exactly `min(n, unread)` bytes from the head, freeing chunks
    /// that become fully consumed. When `drain`, the trimmed bytes are
    /// counted towards `drained`.
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

    /// Read-only view of the queue's bytes as a sequence of `IoSlice`-able
    /// chunks, without mutating the queue.
    pub fn vecs(&self, cap: usize) -> Vec<&[u8]> {
        self.chunks.iter().take(cap).map(Chunk::as_slice).collect()
    }

    /// Whether `base` lies within the current head chunk, i.e. a vec handed
    /// out by [`Self::vecs`] still points at un-trimmed data. Used so that
    /// framing bytes the protocol layer produced around `vecs` output are
    /// never mistaken for queued body bytes.
    pub fn vec_in_head(&self, base: *const u8) -> bool {
        self.chunks
            .front()
            .is_some_and(|c| c.as_slice().as_ptr() == base)
    }
}

/// A consistent, lock-protected view of one stream's producer/consumer
/// buffers, taken atomically under `SharedStream::lock`.
#[derive(Debug, Clone, Copy)]
pub struct SharedSnapshot {
    pub queued_bytes: usize,
    pub pending_bytes: usize,
    pub closed_by_app: bool,
}

impl SharedSnapshot {
    pub fn has_data(&self) -> bool {
        self.queued_bytes + self.pending_bytes > 0
    }

    pub fn is_empty(&self) -> bool {
        self.queued_bytes + self.pending_bytes == 0
    }

    pub fn can_move(&self) -> bool {
        self.pending_bytes == 0 && self.queued_bytes > 0
    }

    pub fn eof_ready(&self) -> bool {
        self.closed_by_app && self.is_empty()
    }
}

struct SharedStreamInner {
    queued: ChunkQueue,
    pending: ChunkQueue,
    closed_by_app: bool,
    hdrs_ready: bool,
    /// The encoded HEADERS frame payload, staged separately from `queued`
    /// since it must reach the wire as its own frame ahead of any DATA.
    header_block: Option<bytes::Bytes>,
    resume_enqueued: bool,
}

/// Per-stream lock-protected state shared between application threads
/// (producer) and the HTTP/3 driver thread (consumer).
pub struct SharedStream {
    inner: Mutex<SharedStreamInner>,
    owner: Arc<SharedState>,
    sid_hint: u64,
}

impl SharedStream {
    pub fn new(owner: Arc<SharedState>, sid_hint: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SharedStreamInner {
                queued: ChunkQueue::new(),
                pending: ChunkQueue::new(),
                closed_by_app: false,
                hdrs_ready: false,
                header_block: None,
                resume_enqueued: false,
            }),
            owner,
            sid_hint,
        })
    }

    pub fn sid_hint(&self) -> u64 {
        self.sid_hint
    }

    // --- producer side -----------------------------------------------------

    /// Copies `buf` into a new chunk appended to `queued`. Returns the
    /// number of bytes accepted (0 once the app already closed the stream;
    /// once `closed_by_app` is true, no further bytes grow `queued`).
    pub fn enqueue_body(&self, buf: bytes::Bytes) -> usize {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        if g.closed_by_app {
            return 0;
        }
        let n = buf.len();
        g.queued.enqueue(buf);
        n
    }

    pub fn mark_closed_by_app(&self) {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        g.closed_by_app = true;
    }

    pub fn hdrs_set_ready(&self) {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        g.hdrs_ready = true;
    }

    /// Stages an already-encoded HEADERS frame payload and marks the
    /// stream ready for header submission in one atomic step.
    pub fn stage_header_block(&self, block: bytes::Bytes) {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        g.header_block = Some(block);
        g.hdrs_ready = true;
    }

    /// Takes the staged header block, if any, clearing `hdrs_ready`.
    /// Idempotent: a second call returns `None`.
    pub fn take_header_block(&self) -> Option<bytes::Bytes> {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        g.hdrs_ready = false;
        g.header_block.take()
    }

    /// Pushes this stream's ID onto the owning connection's resume ring and
    /// wakes the driver thread iff this is an edge transition (the ring was
    /// empty before the push). Safe to call from producer or consumer
    /// threads; never blocks on protocol I/O.
    pub fn request_resume(self: &Arc<Self>) {
        self.owner.request_resume(self);
    }

    // --- consumer side -------------------------------------------------------

    pub fn hdrs_is_ready(&self) -> bool {
        self.inner.lock().expect("shared stream lock poisoned").hdrs_ready
    }

    pub fn hdrs_clear(&self) {
        self.inner.lock().expect("shared stream lock poisoned").hdrs_ready = false;
    }

    pub fn snapshot(&self) -> SharedSnapshot {
        let g = self.inner.lock().expect("shared stream lock poisoned");
        SharedSnapshot {
            queued_bytes: g.queued.unread(),
            pending_bytes: g.pending.unread(),
            closed_by_app: g.closed_by_app,
        }
    }

    /// FIFO-preserving move from `queued` to `pending`, respecting `max`.
    pub fn splice_queued_to_pending(&self, max: usize) -> usize {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        let SharedStreamInner { queued, pending, .. } = &mut *g;
        queued.move_to(pending, max)
    }

    /// Builds a read-only vec array pointing into `pending` without
    /// mutating it. The returned buffers are copied out as owned `Bytes`
    /// slices sharing the underlying allocation, since pending's chunks may
    /// be trimmed concurrently with the caller examining them otherwise.
    pub fn build_vecs_from_pending(&self, cap: usize) -> Vec<bytes::Bytes> {
        let g = self.inner.lock().expect("shared stream lock poisoned");
        g.pending
            .chunks
            .iter()
            .take(cap)
            .map(|c| c.payload.slice(c.off..))
            .collect()
    }

    pub fn trim_pending(&self, n: usize, drain: bool) -> usize {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        g.pending.trim(n, drain)
    }

    /// Trims `len` bytes from `pending` only if `base` is within the
    /// current head chunk, so framing bytes the protocol library produced
    /// around a vec are never mistaken for body bytes.
    pub fn trim_pending_from_vec(&self, base: *const u8, len: usize) -> usize {
        let mut g = self.inner.lock().expect("shared stream lock poisoned");
        if g.pending.vec_in_head(base) {
            g.pending.trim(len, true)
        } else {
            0
        }
    }

    pub fn resume_enqueued(&self) -> bool {
        self.inner.lock().expect("shared stream lock poisoned").resume_enqueued
    }

    fn set_resume_enqueued(&self, v: bool) {
        self.inner.lock().expect("shared stream lock poisoned").resume_enqueued = v;
    }

    /// Cleared only by the consumer after it has dequeued this stream's ID
    /// from the resume ring and serviced it.
    pub fn resume_clear(&self) {
        self.set_resume_enqueued(false);
    }
}

type WakeFn = Box<dyn Fn() + Send + Sync>;

struct SharedStateInner {
    resume: VecDeque<u64>,
}

/// Per-connection lock-protected resume ring plus wake callback. The ring
/// grows (doubling) under lock rather than rejecting a resume request.
pub struct SharedState {
    inner: Mutex<SharedStateInner>,
    wake_cb: Option<WakeFn>,
}

impl SharedState {
    pub fn new(wake_cb: Option<WakeFn>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SharedStateInner { resume: VecDeque::new() }),
            wake_cb,
        })
    }

    fn request_resume(&self, ss: &Arc<SharedStream>) {
        let sid = ss.sid_hint();
        let edge = {
            let mut g = self.inner.lock().expect("shared state lock poisoned");
            if ss.resume_enqueued() {
                return;
            }
            ss.set_resume_enqueued(true);
            let was_empty = g.resume.is_empty();
            g.resume.push_back(sid);
            was_empty
        };
        // wake callback invoked outside the lock, per the concurrency model.
        if edge {
            if let Some(cb) = &self.wake_cb {
                cb();
            }
        }
    }

    /// Pops up to `cap` stream IDs, preserving FIFO order.
    pub fn drain_resume(&self, cap: usize) -> Vec<u64> {
        let mut g = self.inner.lock().expect("shared state lock poisoned");
        let n = g.resume.len().min(cap);
        g.resume.drain(..n).collect()
    }

    pub fn has_resume_pending(&self) -> bool {
        !self.inner.lock().expect("shared state lock poisoned").resume.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_queue_invariants() {
        let mut q = ChunkQueue::new();
        assert!(q.is_empty());
        q.enqueue(bytes::Bytes::from_static(b"hello"));
        q.enqueue(bytes::Bytes::from_static(b"world"));
        assert_eq!(q.unread(), 10);
        let trimmed = q.trim(3, true);
        assert_eq!(trimmed, 3);
        assert_eq!(q.unread(), 7);
        assert_eq!(q.drained(), 3);
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn move_to_only_moves_whole_chunks_that_fit() {
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
    fn move_then_trim_round_trip() {
        let mut src = ChunkQueue::new();
        src.enqueue(bytes::Bytes::from_static(b"0123456789"));
        let mut dst = ChunkQueue::new();
        let moved = src.move_to(&mut dst, 100);
        assert_eq!(src.unread(), 0);
        let trimmed = dst.trim(moved, false);
        assert_eq!(trimmed, moved);
        assert!(dst.is_empty());
    }

    #[test]
    fn shared_stream_hdrs_ready_transitions() {
        let st = SharedState::new(None);
        let ss = SharedStream::new(st, 4);
        assert!(!ss.hdrs_is_ready());
        ss.hdrs_set_ready();
        assert!(ss.hdrs_is_ready());
        ss.hdrs_clear();
        assert!(!ss.hdrs_is_ready());
    }

    #[test]
    fn header_block_staging_is_idempotent_to_take() {
        let st = SharedState::new(None);
        let ss = SharedStream::new(st, 2);
        assert!(!ss.hdrs_is_ready());
        ss.stage_header_block(bytes::Bytes::from_static(b"headers"));
        assert!(ss.hdrs_is_ready());
        assert_eq!(ss.take_header_block().as_deref(), Some(&b"headers"[..]));
        assert!(!ss.hdrs_is_ready());
        assert!(ss.take_header_block().is_none());
    }

    #[test]
    fn closed_by_app_stops_further_enqueues() {
        let st = SharedState::new(None);
        let ss = SharedStream::new(st, 1);
        assert_eq!(ss.enqueue_body(bytes::Bytes::from_static(b"a")), 1);
        ss.mark_closed_by_app();
        assert_eq!(ss.enqueue_body(bytes::Bytes::from_static(b"b")), 0);
        assert_eq!(ss.snapshot().queued_bytes, 1);
    }

    #[test]
    fn resume_ring_coalesces_duplicates() {
        let woken = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let woken2 = woken.clone();
        let st = SharedState::new(Some(Box::new(move || {
            woken2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })));
        let ss = SharedStream::new(st.clone(), 7);
        ss.request_resume();
        ss.request_resume();
        ss.request_resume();
        // only the edge transition (ring empty -> non-empty) wakes.
        assert_eq!(woken.load(std::sync::atomic::Ordering::SeqCst), 1);
        let drained = st.drain_resume(10);
        assert_eq!(drained, vec![7]);
        ss.resume_clear();
        assert!(!ss.resume_enqueued());
    }

    #[test]
    fn eof_ready_requires_both_queues_drained() {
        let snap = SharedSnapshot {
            queued_bytes: 0,
            pending_bytes: 0,
            closed_by_app: true,
        };
        assert!(snap.eof_ready());
        let snap2 = SharedSnapshot {
            queued_bytes: 1,
            pending_bytes: 0,
            closed_by_app: true,
        };
        assert!(!snap2.eof_ready());
    }
}
