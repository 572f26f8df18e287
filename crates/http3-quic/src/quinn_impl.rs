//! [`crate::quic`] trait implementations backed by the real `quinn` QUIC
//! transport, driving the connection directly with no intermediate
//! channel-based proxy layer, since this engine polls everything from a
//! single worker loop.

use std::{
    convert::TryInto,
    future::Future,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};

use http3_proto::proto::stream::StreamId;

use crate::{
    error::Code,
    quic::{self},
    stream::WriteBuf,
};

/// Wraps `quinn::ConnectionError` so it can flow through [`quic::Error`].
#[derive(Debug)]
pub struct ConnectionError(quinn::ConnectionError);

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConnectionError {}

impl quic::Error for ConnectionError {
    fn is_timeout(&self) -> bool {
        matches!(self.0, quinn::ConnectionError::TimedOut)
    }

    fn err_code(&self) -> Option<u64> {
        match self.0 {
            quinn::ConnectionError::ApplicationClosed(ref close) => Some(close.error_code.into()),
            _ => None,
        }
    }
}

impl From<ConnectionError> for Box<dyn quic::Error> {
    fn from(e: ConnectionError) -> Self {
        Box::new(e)
    }
}

impl From<quinn::ConnectionError> for ConnectionError {
    fn from(e: quinn::ConnectionError) -> Self {
        Self(e)
    }
}

/// Wraps `quinn::WriteError`/`quinn::ReadError` so they flow through [`quic::Error`].
#[derive(Debug)]
pub struct StreamError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StreamError {}

impl quic::Error for StreamError {
    fn is_timeout(&self) -> bool {
        false
    }

    fn err_code(&self) -> Option<u64> {
        None
    }
}

impl From<StreamError> for Box<dyn quic::Error> {
    fn from(e: StreamError) -> Self {
        Box::new(e)
    }
}

impl From<quinn::WriteError> for StreamError {
    fn from(e: quinn::WriteError) -> Self {
        Self(Box::new(e))
    }
}

impl From<quinn::ReadError> for StreamError {
    fn from(e: quinn::ReadError) -> Self {
        Self(Box::new(e))
    }
}

/// A QUIC connection handled by `quinn`.
#[derive(Clone)]
pub struct Connection {
    conn: quinn::Connection,
}

impl Connection {
    pub fn new(conn: quinn::Connection) -> Self {
        Self { conn }
    }
}

impl quic::Connection<Bytes> for Connection {
    type BidiStream = BidiStream;
    type SendStream = SendStream;
    type RecvStream = RecvStream;
    type OpenStreams = OpenStreams;
    type Error = ConnectionError;

    fn poll_accept_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::RecvStream>, Self::Error>> {
        let fut = self.conn.accept_uni();
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(recv)) => Poll::Ready(Ok(Some(RecvStream::new(recv)))),
            Poll::Ready(Err(quinn::ConnectionError::ApplicationClosed(_))) => Poll::Ready(Ok(None)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_accept_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::BidiStream>, Self::Error>> {
        let fut = self.conn.accept_bi();
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok((send, recv))) => Poll::Ready(Ok(Some(BidiStream {
                send: SendStream::new(send),
                recv: RecvStream::new(recv),
            }))),
            Poll::Ready(Err(quinn::ConnectionError::ApplicationClosed(_))) => Poll::Ready(Ok(None)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_open_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>> {
        let fut = self.conn.open_bi();
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok((send, recv))) => Poll::Ready(Ok(BidiStream {
                send: SendStream::new(send),
                recv: RecvStream::new(recv),
            })),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_open_send(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>> {
        let fut = self.conn.open_uni();
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(send)) => Poll::Ready(Ok(SendStream::new(send))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn opener(&self) -> Self::OpenStreams {
        OpenStreams { conn: self.conn.clone() }
    }

    fn close(&mut self, code: Code, reason: &[u8]) {
        self.conn.close(code.value().try_into().unwrap_or(u32::MAX).into(), reason);
    }
}

/// A handle able to open streams without the full `Connection`.
#[derive(Clone)]
pub struct OpenStreams {
    conn: quinn::Connection,
}

impl quic::OpenStreams<Bytes> for OpenStreams {
    type BidiStream = BidiStream;
    type SendStream = SendStream;
    type RecvStream = RecvStream;
    type Error = ConnectionError;

    fn poll_open_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>> {
        let fut = self.conn.open_bi();
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok((send, recv))) => Poll::Ready(Ok(BidiStream {
                send: SendStream::new(send),
                recv: RecvStream::new(recv),
            })),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_open_send(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>> {
        let fut = self.conn.open_uni();
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(send)) => Poll::Ready(Ok(SendStream::new(send))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn close(&mut self, code: Code, reason: &[u8]) {
        self.conn.close(code.value().try_into().unwrap_or(u32::MAX).into(), reason);
    }
}

/// A send-only stream backed by `quinn::SendStream`, queuing a [`WriteBuf`]
/// header/payload pair until the transport is ready for more bytes.
pub struct SendStream {
    stream: quinn::SendStream,
    writing: Option<WriteBuf<Bytes>>,
    id: StreamId,
}

impl SendStream {
    fn new(stream: quinn::SendStream) -> Self {
        let id = StreamId::try_from(stream.id().index()).expect("quinn stream id fits in a QUIC varint");
        Self {
            stream,
            writing: None,
            id,
        }
    }
}

impl quic::SendStream<Bytes> for SendStream {
    type Error = StreamError;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        while let Some(data) = &mut self.writing {
            while data.has_remaining() {
                let fut = self.stream.write(data.chunk());
                tokio::pin!(fut);
                match fut.poll(cx) {
                    Poll::Ready(Ok(n)) => data.advance(n),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => return Poll::Pending,
                }
            }
            self.writing = None;
        }
        Poll::Ready(Ok(()))
    }

    fn send_data<T: Into<WriteBuf<Bytes>>>(&mut self, data: T) -> Result<(), Self::Error> {
        if self.writing.is_some() {
            return Err(StreamError(Box::new(std::io::Error::other(
                "previous send_data not yet flushed",
            ))));
        }
        self.writing = Some(data.into());
        Ok(())
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        self.stream.finish().map_err(|e| StreamError(Box::new(e)))?;
        Poll::Ready(Ok(()))
    }

    fn reset(&mut self, reset_code: u64) {
        let _ = self.stream.reset(reset_code.try_into().unwrap_or(quinn::VarInt::MAX));
    }

    fn id(&self) -> StreamId {
        self.id
    }
}

/// A receive-only stream backed by `quinn::RecvStream`.
pub struct RecvStream {
    stream: quinn::RecvStream,
}

impl RecvStream {
    fn new(stream: quinn::RecvStream) -> Self {
        Self { stream }
    }
}

impl quic::RecvStream for RecvStream {
    type Buf = Bytes;
    type Error = StreamError;

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::Buf>, Self::Error>> {
        let fut = self.stream.read_chunk(usize::MAX, true);
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(Some(chunk))) => Poll::Ready(Ok(Some(chunk.bytes))),
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(None)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn stop_sending(&mut self, error_code: u64) {
        let _ = self.stream.stop(error_code.try_into().unwrap_or(quinn::VarInt::MAX));
    }
}

/// A bidirectional stream, splittable into independent send/receive halves.
pub struct BidiStream {
    send: SendStream,
    recv: RecvStream,
}

impl quic::SendStream<Bytes> for BidiStream {
    type Error = StreamError;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.send.poll_ready(cx)
    }

    fn send_data<T: Into<WriteBuf<Bytes>>>(&mut self, data: T) -> Result<(), Self::Error> {
        self.send.send_data(data)
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.send.poll_finish(cx)
    }

    fn reset(&mut self, reset_code: u64) {
        self.send.reset(reset_code)
    }

    fn id(&self) -> StreamId {
        self.send.id()
    }
}

impl quic::RecvStream for BidiStream {
    type Buf = Bytes;
    type Error = StreamError;

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::Buf>, Self::Error>> {
        self.recv.poll_data(cx)
    }

    fn stop_sending(&mut self, error_code: u64) {
        self.recv.stop_sending(error_code)
    }
}

impl quic::BidiStream<Bytes> for BidiStream {
    type SendStream = SendStream;
    type RecvStream = RecvStream;

    fn split(self) -> (Self::SendStream, Self::RecvStream) {
        (self.send, self.recv)
    }
}

/// Pins an `Arc<Connection>` so acceptors sharing one underlying `quinn`
/// connection can each poll independently.
pub type SharedConnection = Arc<tokio::sync::Mutex<Connection>>;
