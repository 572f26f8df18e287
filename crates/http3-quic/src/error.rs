//! HTTP/3 error types: application error codes (RFC 9114 §8.1, RFC 9000
//! §20.1) plus the internal [`Error`]/[`Kind`] pair used to carry a cause and
//! a connection-vs-stream scope alongside the code.

use std::{fmt, sync::Arc};

use http3_proto::qpack;

/// Cause of an error raised by this engine itself, as opposed to one
/// surfaced by the underlying QUIC transport.
type Cause = Box<dyn std::error::Error + Send + Sync>;
/// Error surfaced by the underlying QUIC transport.
pub(crate) type TransportError = Box<dyn crate::quic::Error>;

/// A general error that can occur when handling the HTTP/3 protocol.
#[derive(Clone)]
pub struct Error {
    pub(crate) inner: Box<ErrorImpl>,
}

/// An HTTP/3 "application error code".
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
pub struct Code {
    code: u64,
}

impl Code {
    /// Numerical error code.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9114.html#errors>
    /// and <https://www.rfc-editor.org/rfc/rfc9000.html#error-codes>.
    pub fn value(&self) -> u64 {
        self.code
    }
}

impl PartialEq<u64> for Code {
    fn eq(&self, other: &u64) -> bool {
        *other == self.code
    }
}

#[derive(Clone)]
pub(crate) struct ErrorImpl {
    pub(crate) kind: Kind,
    cause: Option<Arc<Cause>>,
}

/// Some errors affect the whole connection, others only one request or
/// stream. See [errors](https://www.rfc-editor.org/rfc/rfc9114.html#errors).
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ErrorLevel {
    /// Error that closes the whole connection.
    ConnectionError,
    /// Error scoped to a single stream.
    StreamError,
}

#[doc(hidden)]
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Kind {
    #[non_exhaustive]
    Application {
        code: Code,
        reason: Option<Box<str>>,
        level: ErrorLevel,
    },
    #[non_exhaustive]
    HeaderTooBig {
        actual_size: u64,
        max_size: u64,
    },
    Transport(Arc<TransportError>),
    Closed,
    Closing,
    Timeout,
}

macro_rules! codes {
    (
        $(
            $(#[$docs:meta])*
            ($num:expr, $name:ident);
        )+
    ) => {
        impl Code {
        $(
            $(#[$docs])*
            pub const $name: Code = Code{code: $num};
        )+
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.code {
                $(
                    $num => f.write_str(stringify!($name)),
                )+
                    other => write!(f, "{:#x}", other),
                }
            }
        }
    }
}

codes! {
    /// No error. Used to close a connection or stream with no signaled error.
    (0x100, H3_NO_ERROR);
    /// Peer violated protocol requirements in a way with no more specific code.
    (0x101, H3_GENERAL_PROTOCOL_ERROR);
    /// Internal error in the HTTP stack.
    (0x102, H3_INTERNAL_ERROR);
    /// Peer created a stream that will not be accepted.
    (0x103, H3_STREAM_CREATION_ERROR);
    /// A stream required by the connection was closed or reset.
    (0x104, H3_CLOSED_CRITICAL_STREAM);
    /// A frame was received that was not permitted in the current state or stream.
    (0x105, H3_FRAME_UNEXPECTED);
    /// A frame failed to satisfy layout requirements or had an invalid size.
    (0x106, H3_FRAME_ERROR);
    /// Peer is exhibiting a behavior that might generate excessive load.
    (0x107, H3_EXCESSIVE_LOAD);
    /// A stream ID or push ID was used incorrectly.
    (0x108, H3_ID_ERROR);
    /// Error in the payload of a SETTINGS frame.
    (0x109, H3_SETTINGS_ERROR);
    /// No SETTINGS frame was received at the start of the control stream.
    (0x10a, H3_MISSING_SETTINGS);
    /// Server rejected a request without performing any application processing.
    (0x10b, H3_REQUEST_REJECTED);
    /// The request or response was cancelled.
    (0x10c, H3_REQUEST_CANCELLED);
    /// The client's stream terminated without a fully formed request.
    (0x10d, H3_REQUEST_INCOMPLETE);
    /// An HTTP message was malformed.
    (0x10e, H3_MESSAGE_ERROR);
    /// The TCP connection opened for a CONNECT request was reset or closed abnormally.
    (0x10f, H3_CONNECT_ERROR);
    /// The requested operation cannot be served over HTTP/3; retry over HTTP/1.1.
    (0x110, H3_VERSION_FALLBACK);
    /// The decoder failed to interpret an encoded field section.
    (0x200, QPACK_DECOMPRESSION_FAILED);
    /// The decoder failed to interpret an encoder-stream instruction.
    (0x201, QPACK_ENCODER_STREAM_ERROR);
    /// The encoder failed to interpret a decoder-stream instruction.
    (0x202, QPACK_DECODER_STREAM_ERROR);
}

impl Code {
    pub(crate) fn with_reason<S: Into<Box<str>>>(self, reason: S, level: ErrorLevel) -> Error {
        Error::new(Kind::Application {
            code: self,
            reason: Some(reason.into()),
            level,
        })
    }

    #[allow(dead_code)]
    pub(crate) fn with_cause<E: Into<Cause>>(self, cause: E) -> Error {
        Error::from(self).with_cause(cause)
    }

    pub(crate) fn with_transport<E: Into<Box<dyn crate::quic::Error>>>(self, err: E) -> Error {
        Error::new(Kind::Transport(Arc::new(err.into())))
    }
}

impl From<Code> for u64 {
    fn from(code: Code) -> u64 {
        code.code
    }
}

impl Error {
    fn new(kind: Kind) -> Self {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    /// Returns the application error code, if this error carries one.
    pub fn try_get_code(&self) -> Option<Code> {
        match self.inner.kind {
            Kind::Application { code, .. } => Some(code),
            _ => None,
        }
    }

    /// The scope of the error: connection-wide or a single stream.
    pub fn get_error_level(&self) -> ErrorLevel {
        match self.inner.kind {
            Kind::Application { level, .. } => level,
            _ => ErrorLevel::ConnectionError,
        }
    }

    pub(crate) fn header_too_big(actual_size: u64, max_size: u64) -> Self {
        Error::new(Kind::HeaderTooBig { actual_size, max_size })
    }

    pub(crate) fn with_cause<E: Into<Cause>>(mut self, cause: E) -> Self {
        self.inner.cause = Some(Arc::new(cause.into()));
        self
    }

    pub(crate) fn closing() -> Self {
        Self::new(Kind::Closing)
    }

    pub(crate) fn closed() -> Self {
        Self::new(Kind::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    pub(crate) fn is_header_too_big(&self) -> bool {
        matches!(&self.inner.kind, Kind::HeaderTooBig { .. })
    }

    #[cfg(test)]
    #[doc(hidden)]
    pub fn kind(&self) -> Kind {
        self.inner.kind.clone()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");

        match self.inner.kind {
            Kind::Closed => {
                builder.field("connection closed", &true);
            }
            Kind::Closing => {
                builder.field("closing", &true);
            }
            Kind::Timeout => {
                builder.field("timeout", &true);
            }
            Kind::Application { code, ref reason, .. } => {
                builder.field("code", &code);
                if let Some(reason) = reason {
                    builder.field("reason", reason);
                }
            }
            Kind::Transport(ref e) => {
                builder.field("kind", &e);
                builder.field("code", &e.err_code());
            }
            Kind::HeaderTooBig { actual_size, max_size } => {
                builder.field("header_size", &actual_size);
                builder.field("max_size", &max_size);
            }
        }

        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Closed => write!(f, "connection is closed")?,
            Kind::Closing => write!(f, "connection is gracefully closing")?,
            Kind::Transport(ref e) => write!(f, "quic transport error: {}", e)?,
            Kind::Timeout => write!(f, "timeout")?,
            Kind::Application { code, ref reason, .. } => {
                if let Some(reason) = reason {
                    write!(f, "application error: {}", reason)?
                } else {
                    write!(f, "application error {:?}", code)?
                }
            }
            Kind::HeaderTooBig { actual_size, max_size } => write!(
                f,
                "issued header size {} is beyond peer's limit {}",
                actual_size, max_size
            )?,
        };
        if let Some(ref cause) = self.inner.cause {
            write!(f, ", cause: {}", cause)?
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.cause.as_ref().map(|e| &***e as _)
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Error {
        Error::new(Kind::Application {
            code,
            reason: None,
            level: ErrorLevel::ConnectionError,
        })
    }
}

impl From<Box<dyn crate::quic::Error>> for Error {
    fn from(e: Box<dyn crate::quic::Error>) -> Self {
        Code::H3_INTERNAL_ERROR.with_transport(e)
    }
}

impl From<qpack::EncoderError> for Error {
    fn from(e: qpack::EncoderError) -> Self {
        Self::from(Code::QPACK_ENCODER_STREAM_ERROR).with_cause(e)
    }
}

impl From<qpack::DecoderError> for Error {
    fn from(e: qpack::DecoderError) -> Self {
        match e {
            qpack::DecoderError::InvalidStaticIndex(_) => {
                Self::from(Code::QPACK_DECOMPRESSION_FAILED).with_cause(e)
            }
            _ => Self::from(Code::QPACK_DECODER_STREAM_ERROR).with_cause(e),
        }
    }
}
