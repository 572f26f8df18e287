//! Transport-agnostic QUIC traits the HTTP/3 driver is built against.
//!
//! Nothing above this module knows whether streams are backed by `quinn`, a
//! mock transport used in tests, or anything else; it only depends on these
//! trait objects. The `quinn` module in this crate supplies the concrete
//! implementation used in production.

use std::task::{Context, Poll};

use bytes::Buf;

use http3_proto::proto::stream::{InvalidStreamId, StreamId};

use crate::stream::WriteBuf;

/// A transport-level error that can be downcast from an [`Error`].
pub trait Error: std::error::Error + Send + Sync {
    /// Whether the peer stopped responding in time.
    fn is_timeout(&self) -> bool;

    /// The application error code the transport reports closing a stream or
    /// connection with, if any.
    fn err_code(&self) -> Option<u64>;
}

/// A QUIC connection, able to accept and open streams.
pub trait Connection<B: Buf> {
    /// A bidirectional stream.
    type BidiStream: BidiStream<B>;
    /// A send stream.
    type SendStream: SendStream<B>;
    /// A receive stream.
    type RecvStream: RecvStream;
    /// Handle used to open outgoing streams.
    type OpenStreams: OpenStreams<B, BidiStream = Self::BidiStream, SendStream = Self::SendStream>;
    /// Error produced by this connection.
    type Error: Into<Box<dyn Error>>;

    /// Accepts an incoming unidirectional stream.
    fn poll_accept_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::RecvStream>, Self::Error>>;

    /// Accepts an incoming bidirectional stream.
    fn poll_accept_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::BidiStream>, Self::Error>>;

    /// Opens an outgoing bidirectional stream.
    fn poll_open_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>>;

    /// Opens an outgoing unidirectional stream.
    fn poll_open_send(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>>;

    /// Returns a handle that can open new streams without borrowing the connection.
    fn opener(&self) -> Self::OpenStreams;

    /// Closes the connection immediately with the given application code and reason.
    fn close(&mut self, code: crate::error::Code, reason: &[u8]);
}

/// A handle able to open new streams, independent of polling the connection
/// for new incoming ones.
pub trait OpenStreams<B: Buf> {
    /// A bidirectional stream.
    type BidiStream: BidiStream<B>;
    /// A send stream.
    type SendStream: SendStream<B>;
    /// A receive stream.
    type RecvStream: RecvStream;
    /// Error produced when opening streams.
    type Error: Into<Box<dyn Error>>;

    /// Opens an outgoing bidirectional stream.
    fn poll_open_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>>;

    /// Opens an outgoing unidirectional stream.
    fn poll_open_send(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>>;

    /// Closes the connection immediately with the given application code and reason.
    fn close(&mut self, code: crate::error::Code, reason: &[u8]);
}

/// A stream that can send data to the peer.
pub trait SendStream<B: Buf> {
    /// Error produced while sending.
    type Error: Into<Box<dyn Error>>;

    /// Polls whether more data can be written; must be called before `send_data`.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// Sends a chunk of data, encoding any pending frame or stream-type header.
    fn send_data<T: Into<WriteBuf<B>>>(&mut self, data: T) -> Result<(), Self::Error>;

    /// Polls completion of stream shutdown.
    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// Resets the stream with the given application error code.
    fn reset(&mut self, reset_code: u64);

    /// The ID of this stream.
    fn id(&self) -> StreamId;
}

/// A stream that can receive data from the peer.
pub trait RecvStream {
    /// The buffer type yielded by `poll_data`.
    type Buf: Buf;
    /// Error produced while receiving.
    type Error: Into<Box<dyn Error>>;

    /// Polls for the next chunk of data, or `None` on clean end of stream.
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::Buf>, Self::Error>>;

    /// Stops receiving with the given application error code.
    fn stop_sending(&mut self, error_code: u64);
}

/// A bidirectional stream, splittable into independent send/receive halves.
pub trait BidiStream<B: Buf>: SendStream<B> + RecvStream {
    /// The send half once split.
    type SendStream: SendStream<B>;
    /// The receive half once split.
    type RecvStream: RecvStream;

    /// Splits this stream into independent send and receive halves.
    fn split(self) -> (Self::SendStream, Self::RecvStream);
}

pub(crate) fn invalid_stream_id(e: InvalidStreamId) -> crate::Error {
    crate::error::Code::H3_ID_ERROR.with_reason(e.to_string(), crate::error::ErrorLevel::ConnectionError)
}
