//! Http3StreamManager: per-stream state integrating frame parsing with
//! QUIC I/O, request assembly, response header submission, and body
//! streaming.

use std::future::poll_fn;
use std::io::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};

use http3_proto::proto::frame::{Frame, PayloadLen};
use http3_proto::proto::headers::Header;
use http3_proto::proto::stream::StreamId;
use http3_quic::frame::FrameStream;
use http3_quic::quic::{RecvStream, SendStream};

use crate::config::H3DriverConfig;
use crate::shared::SharedStream;
use crate::sock::{DispatchRequest, RequestBody, Sock};

/// `io_state` bitmask for a stream's lifecycle flags, a plain integer flag
/// set rather than reaching for a bitflags crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoState(u8);

impl IoState {
    pub const RX_FIN: IoState = IoState(0b0000_0001);
    pub const TX_FIN: IoState = IoState(0b0000_0010);
    pub const RESET: IoState = IoState(0b0000_0100);
    pub const REQ_READY: IoState = IoState(0b0000_1000);
    pub const REQ_DISPATCHED: IoState = IoState(0b0001_0000);

    fn from_bits_truncate(bits: u8) -> Self {
        IoState(bits)
    }

    fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: IoState) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Debug-only guard mirroring the original driver's `NS_ENABLE_THREAD_AFFINITY`
/// opt-in assertions (`quic/thread-affinity.h`): records the `tokio` task that
/// is allowed to touch fields the QUIC driver owns exclusively, and asserts
/// on it in debug builds. A no-op in release builds, same as the original.
#[derive(Debug)]
struct ThreadAffinity {
    #[cfg(debug_assertions)]
    owner: tokio::task::Id,
}

impl ThreadAffinity {
    fn current() -> Self {
        Self {
            #[cfg(debug_assertions)]
            owner: tokio::task::try_id().expect("ThreadAffinity::current called outside a tokio task"),
        }
    }

    #[cfg(debug_assertions)]
    fn assert_current(&self) {
        let current = tokio::task::try_id().expect("assert_current called outside a tokio task");
        debug_assert_eq!(self.owner, current, "writer pass touched from a task other than the connection driver");
    }

    #[cfg(not(debug_assertions))]
    fn assert_current(&self) {}
}

/// Per-stream context. Holds the send half directly (behind a mutex, since
/// both the receive task and the connection-wide writer pass may touch it
/// at stream-teardown time) and the [`SharedStream`] the application
/// produces its response through.
pub struct StreamCtx<S> {
    pub stream_id: StreamId,
    pub send: tokio::sync::Mutex<S>,
    pub shared: Arc<SharedStream>,
    io_state: AtomicU8,
    /// Set for the duration of one writer pass once this stream has been
    /// served, so it is not serviced twice in the same pass.
    tx_served_this_step: std::sync::atomic::AtomicBool,
    /// Captured from whichever task constructs this `StreamCtx` — the
    /// connection driver task, per `accept_request_stream` — and asserted
    /// against on every writer pass.
    affinity: ThreadAffinity,
}

impl<S> StreamCtx<S> {
    pub fn new(stream_id: StreamId, send: S, shared: Arc<SharedStream>) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            send: tokio::sync::Mutex::new(send),
            shared,
            io_state: AtomicU8::new(0),
            tx_served_this_step: std::sync::atomic::AtomicBool::new(false),
            affinity: ThreadAffinity::current(),
        })
    }

    pub fn io_state(&self) -> IoState {
        IoState::from_bits_truncate(self.io_state.load(Ordering::Acquire))
    }

    pub fn set_io_state(&self, bit: IoState) {
        self.io_state.fetch_or(bit.bits(), Ordering::AcqRel);
    }

    /// Claims dispatch exactly once. Returns true the first time.
    pub fn claim_dispatch(&self) -> bool {
        let prev = self.io_state.fetch_or(IoState::REQ_DISPATCHED.bits(), Ordering::AcqRel);
        prev & IoState::REQ_DISPATCHED.bits() == 0
    }

    pub fn begin_writer_pass(&self) {
        self.tx_served_this_step.store(false, Ordering::Release);
    }

    /// Claims this stream's single service slot for the current writer
    /// pass. Returns true the first time it's called since the last
    /// `begin_writer_pass`.
    pub fn claim_service_slot(&self) -> bool {
        !self.tx_served_this_step.swap(true, Ordering::AcqRel)
    }

    /// A stream can be reaped once both directions are finished (or reset)
    /// and its producer/consumer queues are fully drained.
    pub fn finalizable(&self) -> bool {
        let st = self.io_state();
        let both_fin = st.contains(IoState::RX_FIN) && st.contains(IoState::TX_FIN);
        let reset = st.contains(IoState::RESET);
        (both_fin || reset) && self.shared.snapshot().is_empty()
    }
}

/// Reads one request off a freshly-accepted bidirectional stream: the
/// HEADERS frame (QPACK stateless-decoded into pseudo + regular headers)
/// and, if present, the DATA frame(s) making up the body.
pub async fn receive_request<R>(
    recv: R,
    config: &H3DriverConfig,
) -> Result<(Method, String, Option<String>, Option<String>, HeaderMap, RequestBody), ReceiveError>
where
    R: RecvStream,
{
    let mut frames = FrameStream::<R, Bytes>::new(recv);

    let header_block = loop {
        match poll_fn(|cx| frames.poll_next(cx)).await? {
            Some(Frame::Headers(block)) => break block,
            Some(Frame::Data(PayloadLen(_))) => return Err(ReceiveError::DataBeforeHeaders),
            Some(_) => continue, // settings-unrelated frames on a request stream are ignored
            None => return Err(ReceiveError::ClosedBeforeHeaders),
        }
    };

    let decoded = http3_proto::qpack::decode_stateless(&mut std::io::Cursor::new(header_block.as_ref()), config.max_field_section_size)?;
    let header = Header::try_from(decoded.fields)?;
    let (method, uri, headers) = header.into_request_parts()?;

    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let authority = uri.authority().map(|a| a.as_str().to_string());
    let scheme = uri.scheme().map(|s| s.as_str().to_string());

    let no_body = method == Method::HEAD || content_length.is_none_or(|cl| cl == 0);
    if no_body {
        return Ok((method, path, authority, scheme, headers, RequestBody::None));
    }

    let expect = content_length.unwrap_or(0);
    let body = if expect >= config.maxupload {
        receive_body_spooled(&mut frames, expect).await?
    } else {
        receive_body_memory(&mut frames, expect).await?
    };

    Ok((method, path, authority, scheme, headers, body))
}

async fn receive_body_memory<R>(frames: &mut FrameStream<R, Bytes>, expect: u64) -> Result<RequestBody, ReceiveError>
where
    R: RecvStream,
{
    let mut buf = BytesMut::with_capacity(expect.min(1 << 20) as usize);
    let mut received: u64 = 0;
    while received < expect {
        match poll_fn(|cx| frames.poll_next(cx)).await? {
            Some(Frame::Data(PayloadLen(_))) => {
                while let Some(chunk) = poll_fn(|cx| frames.poll_data(cx)).await? {
                    received += chunk.remaining() as u64;
                    buf.extend_from_slice(chunk.chunk());
                }
            }
            Some(_) => continue,
            None => break,
        }
    }
    Ok(RequestBody::Memory(buf.freeze()))
}

async fn receive_body_spooled<R>(frames: &mut FrameStream<R, Bytes>, expect: u64) -> Result<RequestBody, ReceiveError>
where
    R: RecvStream,
{
    let tmp = tempfile::NamedTempFile::new().map_err(ReceiveError::Spool)?;
    let (mut file, path) = tmp.keep().map_err(|e| ReceiveError::Spool(e.error))?;
    let mut received: u64 = 0;
    while received < expect {
        match poll_fn(|cx| frames.poll_next(cx)).await? {
            Some(Frame::Data(PayloadLen(_))) => {
                while let Some(chunk) = poll_fn(|cx| frames.poll_data(cx)).await? {
                    received += chunk.remaining() as u64;
                    file.write_all(chunk.chunk()).map_err(ReceiveError::Spool)?;
                }
            }
            Some(_) => continue,
            None => break,
        }
    }
    Ok(RequestBody::SpooledFile { path, file })
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("DATA frame arrived before HEADERS")]
    DataBeforeHeaders,
    #[error("stream closed before HEADERS were received")]
    ClosedBeforeHeaders,
    #[error("frame stream error: {0:?}")]
    Frame(#[from] http3_quic::frame::FrameStreamError),
    #[error("qpack decode error: {0}")]
    Qpack(#[from] http3_proto::qpack::DecoderError),
    #[error("header error: {0}")]
    Header(#[from] http3_proto::proto::headers::HeaderError),
    #[error("spool I/O error: {0}")]
    Spool(std::io::Error),
}

/// Drives one accepted bidirectional request stream end to end: receive the
/// request, dispatch it to the application, and let the connection's
/// writer pass (driven off resumes) carry the response bytes out over
/// `send`. This function owns the receive half only; `send` already lives
/// in the connection's stream table so the writer pass can reach it.
pub async fn serve_request_stream<R>(
    recv: R,
    ctx: Arc<StreamCtx<impl SendStream<Bytes>>>,
    config: H3DriverConfig,
    dispatcher: Arc<dyn DispatchRequest>,
) where
    R: RecvStream,
{
    match receive_request(recv, &config).await {
        Ok((method, path, authority, scheme, headers, body)) => {
            ctx.set_io_state(IoState::RX_FIN);
            if ctx.claim_dispatch() {
                let sock = Sock::new(method, path, authority, scheme, headers, body, ctx.shared.clone());
                dispatcher.dispatch_request(sock).await;
            }
        }
        Err(e) => {
            tracing::warn!(error = ?e, "request stream receive failed");
            ctx.set_io_state(IoState::RESET);
            ctx.shared.mark_closed_by_app();
            ctx.shared.request_resume();
        }
    }
}

/// The connection-wide writer pass for one stream, invoked when its ID is
/// drained off the resume ring. Submits staged response headers at most
/// once, then drains `pending` as DATA frames, finally concluding the
/// stream with a FIN once the shared queues report EOF-ready.
pub async fn service_stream_write<S>(ctx: &Arc<StreamCtx<S>>, max_vecs_per_pass: usize) -> Result<(), WriteError>
where
    S: SendStream<Bytes>,
{
    ctx.affinity.assert_current();

    if !ctx.claim_service_slot() {
        return Ok(());
    }

    let mut send = ctx.send.lock().await;

    if let Some(block) = ctx.shared.take_header_block() {
        http3_quic::stream::write(&mut *send, Frame::Headers(block))
            .await
            .map_err(WriteError::Transport)?;
    }

    if ctx.shared.snapshot().can_move() {
        ctx.shared.splice_queued_to_pending(usize::MAX);
    }

    let vecs = ctx.shared.build_vecs_from_pending(max_vecs_per_pass);
    for vec in vecs {
        let base = vec.as_ptr();
        let len = vec.len();
        http3_quic::stream::write(&mut *send, Frame::Data(vec))
            .await
            .map_err(WriteError::Transport)?;
        ctx.shared.trim_pending_from_vec(base, len);
    }

    let snap = ctx.shared.snapshot();
    if snap.eof_ready() && !ctx.io_state().contains(IoState::TX_FIN) {
        poll_fn(|cx| send.poll_finish(cx))
            .await
            .map_err(|e| WriteError::Transport(transport_err(e)))?;
        ctx.set_io_state(IoState::TX_FIN);
    }

    Ok(())
}

/// Lifts a transport-specific send-stream error (bound only by
/// `Into<Box<dyn quic::Error>>`) into the driver's own concrete error type.
fn transport_err<E: Into<Box<dyn http3_quic::quic::Error>>>(e: E) -> http3_quic::Error {
    http3_quic::Error::from(e.into())
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("transport error while writing response: {0}")]
    Transport(http3_quic::Error),
}
