//! External interfaces: the `dispatch_request` upcall the core consumes,
//! and the Send/Close handles the application uses to produce a response.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};

use crate::header_encode::{encode_response_headers, HeaderEncodeError};
use crate::shared::SharedStream;

/// Where a request body ended up once fully received.
pub enum RequestBody {
    /// No body (no content-length, content-length == 0, or method is HEAD).
    None,
    /// Bounded in-memory buffer.
    Memory(Bytes),
    /// Spooled to a temp file because it exceeded `maxupload` or its size
    /// was unknown ahead of time.
    SpooledFile {
        path: std::path::PathBuf,
        file: std::fs::File,
    },
}

/// An accepted server-side connection object, constructed by the core once
/// a request's headers (and, if present, its complete or spooled body) are
/// ready. Carries everything a "dispatch a finished request" upcall needs
/// and nothing more.
pub struct Sock {
    pub method: Method,
    pub path: String,
    pub authority: Option<String>,
    pub scheme: Option<String>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    shared: Arc<SharedStream>,
}

impl Sock {
    pub(crate) fn new(
        method: Method,
        path: String,
        authority: Option<String>,
        scheme: Option<String>,
        headers: HeaderMap,
        body: RequestBody,
        shared: Arc<SharedStream>,
    ) -> Self {
        Self {
            method,
            path,
            authority,
            scheme,
            headers,
            body,
            shared,
        }
    }

    /// A handle the application can use to produce the response. Cloning
    /// is cheap (it is just a reference to the same [`SharedStream`]); the
    /// application is expected to keep at most one response in flight per
    /// `Sock`.
    pub fn responder(&self) -> Responder {
        Responder {
            shared: self.shared.clone(),
            status: None,
        }
    }
}

/// The external Send/Close interface: an application-thread entry
/// point for staging response headers and enqueuing body bytes. The first
/// `send` call (or first call since the last response) stages headers;
/// subsequent calls enqueue body bytes into `SharedStream.queued`.
pub struct Responder {
    shared: Arc<SharedStream>,
    status: Option<http::StatusCode>,
}

impl Responder {
    /// Encodes `status`/`headers` into a QPACK-compressed HEADERS frame
    /// payload, stages it ahead of any already-queued body bytes, and
    /// requests a resume so the writer step picks it up. Fails only if the
    /// caller supplied a forbidden pseudo-header field.
    pub fn send_headers(&mut self, status: http::StatusCode, headers: HeaderMap) -> Result<(), HeaderEncodeError> {
        self.status = Some(status);
        let fields = encode_response_headers(status, &headers)?;
        let mut block = BytesMut::new();
        http3_proto::qpack::encode_stateless(&mut block, fields.iter())?;
        self.shared.stage_header_block(block.freeze());
        self.shared.request_resume();
        Ok(())
    }

    /// Enqueues body bytes into `SharedStream.queued`. Returns the number
    /// of bytes accepted (0 if the stream was already closed by the app).
    /// Each call requests a resume and the caller is expected to have
    /// armed per-stream POLLOUT interest via the resume request alone —
    /// there is no separate "arm write" call.
    pub fn send_data(&mut self, buf: Bytes) -> usize {
        let n = self.shared.enqueue_body(buf);
        self.shared.request_resume();
        n
    }

    /// Marks `closed_by_app` and requests a final resume so the writer can
    /// flush the terminal FIN once the queues drain.
    pub fn close(&mut self) {
        self.shared.mark_closed_by_app();
        self.shared.request_resume();
    }
}

/// The single upcall the core makes into the application once a request is
/// ready for dispatch. Implementations take ownership of producing the
/// response via the `Sock`'s `Responder`; the upcall itself returns as soon
/// as that ownership has been handed off (it does not block on the
/// response being complete).
#[async_trait::async_trait]
pub trait DispatchRequest: Send + Sync {
    async fn dispatch_request(&self, sock: Sock);
}

#[async_trait::async_trait]
impl<F, Fut> DispatchRequest for F
where
    F: Fn(Sock) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn dispatch_request(&self, sock: Sock) {
        (self)(sock).await
    }
}
