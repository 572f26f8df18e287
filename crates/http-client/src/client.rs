//! HttpClient state machine: request construction, connect (direct
//! or CONNECT-tunneled through a proxy), the WRITE/READ send-and-receive
//! states, and result-dictionary delivery, as one `async fn` executed on
//! a [`crate::task::TaskQueue`] — the queue supplies the "single worker
//! thread drives every task" contract; this function is the per-task
//! callback that thread dispatches.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::chunked_codec::ChunkedDecoder;
use crate::client_log::{ClientLog, LogEntry};
use crate::config::{ClientConfig, PerServerConfig};
use crate::error::{Error, Kind, Result};
use crate::headers::{find_headers_end, parse_header_block, parse_status_line};
use crate::keepalive::{CachedConn, CloseWaitingEntry, KeepAliveCache};
use crate::task::{next_id, TaskHandle, TaskQueuePool};
use crate::tls::build_client_config;
use crate::url::RequestUrl;

/// Large uploads/downloads above this size spool to a file instead of
/// growing the in-memory buffer.
const DEFAULT_SPOOL_LIMIT: usize = 1 << 20;
const WRITE_CHUNK: usize = 16 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const USER_AGENT: &str = concat!("http-client/", env!("CARGO_PKG_VERSION"));

/// Controls when a response body spills from memory to a temp file:
/// `None` disables spooling (everything stays in-memory); `Some(0)` spools
/// every non-empty body; `Some(n)` spools once the body reaches `n` bytes.
/// The response is still fully read into memory first (no streaming
/// decompressor seam exists to spool mid-flight without one) and spilled
/// to a temporary file afterwards if the limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolLimit(pub Option<u64>);

impl Default for SpoolLimit {
    fn default() -> Self {
        SpoolLimit(Some(DEFAULT_SPOOL_LIMIT as u64))
    }
}

impl SpoolLimit {
    fn exceeded_by(&self, len: u64) -> bool {
        self.0.is_some_and(|limit| len >= limit)
    }
}

/// A CONNECT-tunneling HTTP proxy, dialed before the origin's own
/// TCP/TLS handshake.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// `false` forwards the absolute-form request directly to the proxy
    /// instead of tunneling; only meaningful for plain `http://` targets.
    pub tunnel: bool,
}

/// Where the outgoing request body comes from.
#[derive(Debug, Clone)]
pub enum BodySource {
    None,
    Memory(Bytes),
    File(PathBuf),
}

/// Where the incoming response body is written.
#[derive(Debug, Clone, Default)]
pub enum BodySink {
    #[default]
    Memory,
    File(PathBuf),
}

/// A fully-built HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: RequestUrl,
    pub headers: HeaderMap,
    pub body: BodySource,
    /// When false (default), a caller-supplied `Host` is stripped and
    /// replaced with the canonical authority.
    pub keep_host_header: bool,
    pub timeout: Duration,
    /// `0s` (default) disables keep-alive for this request's connection.
    pub keepalive: Duration,
    pub proxy: Option<ProxyConfig>,
    pub decompress: bool,
    pub spool_limit: SpoolLimit,
    /// When true, partial results (headers/bytes received so far) are
    /// returned alongside an error instead of only the error.
    pub partial_results: bool,
    /// Force the body to be classified as binary regardless of content
    /// type.
    pub binary: bool,
    pub sink: BodySink,
    pub cfg: PerServerConfig,
}

impl Request {
    pub fn new(method: Method, url: RequestUrl) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: BodySource::None,
            keep_host_header: false,
            timeout: Duration::from_secs(30),
            keepalive: Duration::ZERO,
            proxy: None,
            decompress: true,
            spool_limit: SpoolLimit::default(),
            partial_results: false,
            binary: false,
            sink: BodySink::Memory,
            cfg: PerServerConfig::default(),
        }
    }

    pub fn get(url: &str) -> Result<Self> {
        Ok(Self::new(Method::GET, RequestUrl::parse(url)?))
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = BodySource::Memory(body);
        self
    }

    pub fn body_file(mut self, path: PathBuf) -> Self {
        self.body = BodySource::File(path);
        self
    }

    pub fn spool_to_file(mut self, path: PathBuf) -> Self {
        self.sink = BodySink::File(path);
        self
    }

    pub fn spool_limit(mut self, limit: SpoolLimit) -> Self {
        self.spool_limit = limit;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn server_config(mut self, cfg: PerServerConfig) -> Self {
        self.cfg = cfg;
        self
    }
}

/// Body classification result for the `body` result-dictionary key:
/// text is decoded with the content-type's charset (UTF-8 fallback);
/// everything else is returned as raw bytes or a spool path.
#[derive(Debug)]
pub enum BodyOutput {
    Text(String),
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// The result dictionary returned for a completed request.
#[derive(Debug)]
pub struct HttpResult {
    pub status: u16,
    pub elapsed: Duration,
    pub headers: HeaderMap,
    pub body: BodyOutput,
    pub https: bool,
    pub flags: Vec<&'static str>,
    pub state: Option<&'static str>,
    pub error: Option<String>,
    pub reused: bool,
    pub sent: u64,
    pub received: u64,
}

/// Owns the task-queue pool, the process-wide keep-alive cache, and this
/// server's request log; the façade an embedder drives requests through.
pub struct HttpClient {
    pool: TaskQueuePool,
    keepalive_cache: Arc<KeepAliveCache>,
    log: Arc<ClientLog>,
}

impl HttpClient {
    pub async fn new(config: ClientConfig, per_server: &PerServerConfig) -> std::io::Result<Self> {
        let config = config.validated();
        let pool = TaskQueuePool::new(config.nshttptaskthreads);
        let keepalive_cache = KeepAliveCache::new();
        crate::keepalive::spawn_janitor(keepalive_cache.clone());
        let log = Arc::new(ClientLog::open(per_server).await?);
        Ok(Self { pool, keepalive_cache, log })
    }

    /// Asynchronous delivery: enqueues the task and returns a handle
    /// immediately; the caller later calls `.wait(timeout)` on it (the
    /// done-callback variant is the caller's own continuation on the
    /// returned future).
    pub fn queue(&self, req: Request) -> TaskHandle<HttpResult> {
        let cache = self.keepalive_cache.clone();
        let log = self.log.clone();
        self.pool.pick().enqueue(move |cancel| async move { execute(req, cancel, cache, log).await })
    }

    /// Synchronous delivery: runs the task on its queue and blocks
    /// the caller until it completes.
    pub async fn run(&self, req: Request) -> Result<HttpResult> {
        let cache = self.keepalive_cache.clone();
        let log = self.log.clone();
        self.pool
            .pick()
            .run_sync(move |cancel| async move { execute(req, cancel, cache, log).await })
            .await
    }
}

async fn execute(req: Request, cancel: CancellationToken, cache: Arc<KeepAliveCache>, log: Arc<ClientLog>) -> Result<HttpResult> {
    let start = Instant::now();
    let deadline = start + req.timeout;
    let method_str = req.method.to_string();
    let url_str = req.url.absolute_form_target();
    let thread_name = format!("httptask-{}", next_id());

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::protocol("http request cancelled")),
        r = run_request(req, deadline, &cache) => r,
    };

    let elapsed = start.elapsed();
    let (status, sent, received, reused, cause) = match &result {
        Ok(r) => (r.status, r.sent, r.received, r.reused, "ok"),
        Err(e) => (0, 0, 0, false, cause_for_error(e)),
    };
    log.write_line(&LogEntry {
        thread_name: &thread_name,
        status,
        method: &method_str,
        url: &url_str,
        elapsed,
        sent,
        received,
        reused,
        cause,
    })
    .await;

    result.map(|mut r| {
        r.elapsed = elapsed;
        r
    })
}

/// Maps a terminal error onto the client-log `cause` column: a
/// `Kind::Timeout` is further split by the phase tag its message carries
/// (`connect`/`write`/`tls setup`/`tls handshake`), since `Error` itself
/// only carries a short message, not a structured phase.
fn cause_for_error(e: &Error) -> &'static str {
    if e.kind() != Kind::Timeout {
        return "error";
    }
    let msg = e.message();
    if msg.starts_with("connect") {
        "connecttimeout"
    } else if msg.starts_with("write") {
        "writetimeout"
    } else if msg.starts_with("tls setup") {
        "tlssetuptimeout"
    } else if msg.starts_with("tls handshake") {
        "tlsconnecttimeout"
    } else {
        "tasktimeout"
    }
}

async fn run_request(mut req: Request, deadline: Instant, cache: &KeepAliveCache) -> Result<HttpResult> {
    normalize_headers(&mut req)?;
    let request_line = build_request_line(&req);
    let header_block = serialize_headers(&req.headers);

    let (target_host, target_port) = match &req.proxy {
        Some(p) => (p.host.clone(), p.port),
        None => (req.url.host.clone(), req.url.port),
    };

    let (mut conn, reused, cache_slot) = connect(&req, &target_host, target_port, deadline, cache).await?;

    let mut head = Vec::with_capacity(request_line.len() + header_block.len());
    head.extend_from_slice(request_line.as_bytes());
    head.extend_from_slice(header_block.as_bytes());

    let write_result = send_request(&mut conn, &head, &req.body, deadline).await;
    let mut sent = match write_result {
        Ok(n) => n,
        Err(e) => {
            if let Some(pos) = cache_slot {
                cache.invalidate(pos).await;
            }
            return Err(e);
        }
    };

    let read_result = read_response(&mut conn, &req, deadline).await;
    let (status_line, headers, mut body, mut received) = match read_result {
        Ok(v) => v,
        Err(e) => {
            if let Some(pos) = cache_slot {
                cache.invalidate(pos).await;
            }
            return Err(e);
        }
    };
    sent += request_line.len() as u64 + header_block.len() as u64;

    let reuse_eligible = req.keepalive > Duration::ZERO && !forbids_keepalive(&headers);
    if reuse_eligible {
        cache
            .add(CloseWaitingEntry {
                conn,
                host: target_host,
                port: target_port,
                expire: Instant::now() + req.keepalive,
            })
            .await;
    } else if let Some(pos) = cache_slot {
        // Borrowed a slot but aren't returning it: make sure it stays gone.
        cache.invalidate(pos).await;
    }

    let output = classify_body(&req, &headers, std::mem::take(&mut body))?;
    received += output_len(&output) as u64;

    Ok(HttpResult {
        status: status_line.status.as_u16(),
        elapsed: Duration::ZERO, // filled in by `execute` once the phase is over.
        headers,
        body: output,
        https: req.url.https,
        flags: flags_for(reused, req.url.https),
        state: None,
        error: None,
        reused,
        sent,
        received,
    })
}

fn flags_for(reused: bool, https: bool) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if reused {
        flags.push("reused");
    }
    if https {
        flags.push("https");
    }
    flags
}

fn output_len(output: &BodyOutput) -> usize {
    match output {
        BodyOutput::Text(s) => s.len(),
        BodyOutput::Bytes(b) => b.len(),
        BodyOutput::File(_) => 0,
    }
}

/// Host-header canonicalization, content-length, accept-encoding,
/// user-agent, and connection headers.
fn normalize_headers(req: &mut Request) -> Result<()> {
    if !req.keep_host_header {
        req.headers.remove(http::header::HOST);
        let host_value = HeaderValue::from_str(&req.url.host_header_value())
            .map_err(|_| Error::config("host value is not a valid header value"))?;
        req.headers.insert(http::header::HOST, host_value);
    } else if !req.headers.contains_key(http::header::HOST) {
        return Err(Error::config("keep_host_header set but no Host header supplied"));
    }

    let body_len = match &req.body {
        BodySource::None => Some(0u64),
        BodySource::Memory(b) => Some(b.len() as u64),
        BodySource::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
    };
    if let Some(len) = body_len {
        req.headers
            .insert(http::header::CONTENT_LENGTH, HeaderValue::from_str(&len.to_string()).expect("digits are valid"));
    }

    if req.decompress && !req.headers.contains_key(http::header::ACCEPT_ENCODING) {
        req.headers
            .insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
    }
    if !req.headers.contains_key(http::header::USER_AGENT) {
        req.headers.insert(http::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    }
    if req.keepalive.is_zero() && !req.headers.contains_key(http::header::CONNECTION) {
        req.headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    }
    Ok(())
}

fn build_request_line(req: &Request) -> String {
    let target = match &req.proxy {
        Some(p) if !p.tunnel => req.url.absolute_form_target(),
        _ => req.url.origin_form_target().to_string(),
    };
    format!("{} {} HTTP/1.1\r\n", req.method, target)
}

fn serialize_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or(""));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        return Err(Error::timeout("deadline already elapsed"));
    }
    Ok(deadline - now)
}

async fn connect(
    req: &Request,
    host: &str,
    port: u16,
    deadline: Instant,
    cache: &KeepAliveCache,
) -> Result<(CachedConn, bool, Option<usize>)> {
    if req.keepalive > Duration::ZERO {
        if let Some((entry, position)) = cache.take(host, port).await {
            return Ok((entry.conn, true, Some(position)));
        }
    }

    let tcp = match &req.proxy {
        Some(proxy) if proxy.tunnel => {
            let mut tunnel = dial_tcp(&proxy.host, proxy.port, deadline).await?;
            connect_tunnel(&mut tunnel, host, port, deadline).await?;
            tunnel
        }
        _ => dial_tcp(host, port, deadline).await?,
    };

    if !req.url.https {
        return Ok((CachedConn::Plain(tcp), false, None));
    }

    let peer_ip = tcp.peer_addr().map(|a| a.ip()).unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let tls_config = build_client_config(&req.cfg, peer_ip)?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| Error::config("invalid TLS server name"))?;
    let handshake_timeout = remaining(deadline).map_err(|_| Error::timeout("tls handshake timed out"))?;
    let tls = tokio::time::timeout(handshake_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::timeout("tls handshake timed out"))?
        .map_err(|e| Error::transport(format!("tls handshake failed: {e}")))?;
    Ok((CachedConn::Tls(Box::new(tls)), false, None))
}

async fn dial_tcp(host: &str, port: u16, deadline: Instant) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let connect_timeout = remaining(deadline).map_err(|_| Error::timeout("connect timed out"))?;
    tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::timeout("connect timed out"))?
        .map_err(|e| Error::transport(format!("connect failed: {e}")))
}

/// Sends `CONNECT host:port HTTP/1.1\r\nHost: host:port\r\n\r\n`, expecting
/// a 2xx status before the origin's own TLS handshake begins.
async fn connect_tunnel(tunnel: &mut TcpStream, host: &str, port: u16, deadline: Instant) -> Result<()> {
    let authority = crate::headers::build_location(None, host, port, port);
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    let write_timeout = remaining(deadline).map_err(|_| Error::timeout("write timed out"))?;
    tokio::time::timeout(write_timeout, tunnel.write_all(request.as_bytes()))
        .await
        .map_err(|_| Error::timeout("write timed out"))?
        .map_err(Error::from)?;

    let mut buf = Vec::new();
    loop {
        if find_headers_end(&buf).is_some() {
            break;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let read_timeout = remaining(deadline).map_err(|_| Error::timeout("connect timed out"))?;
        let n = tokio::time::timeout(read_timeout, tunnel.read(&mut chunk))
            .await
            .map_err(|_| Error::timeout("connect timed out"))?
            .map_err(Error::from)?;
        if n == 0 {
            return Err(Error::protocol("proxy closed connection during CONNECT"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = find_headers_end(&buf).expect("loop only exits once found");
    let head = String::from_utf8_lossy(&buf[..end]);
    let line_end = head.find("\r\n").unwrap_or(head.len());
    let status_line = parse_status_line(&head[..line_end])?;
    if !status_line.status.is_success() {
        return Err(Error::protocol(format!("proxy CONNECT rejected: {}", status_line.status)));
    }
    Ok(())
}

async fn send_request(conn: &mut CachedConn, head: &[u8], body: &BodySource, deadline: Instant) -> Result<u64> {
    write_all_with_deadline(conn, head, deadline).await?;
    let body_sent = match body {
        BodySource::None => 0,
        BodySource::Memory(bytes) => {
            write_all_with_deadline(conn, bytes, deadline).await?;
            bytes.len() as u64
        }
        BodySource::File(path) => spool_file_to_conn(conn, path, deadline).await?,
    };
    Ok(body_sent)
}

async fn write_all_with_deadline(conn: &mut CachedConn, buf: &[u8], deadline: Instant) -> Result<()> {
    let timeout = remaining(deadline).map_err(|_| Error::timeout("write timed out"))?;
    tokio::time::timeout(timeout, conn.write_all(buf))
        .await
        .map_err(|_| Error::timeout("write timed out"))?
        .map_err(Error::from)
}

/// WRITE (spool mode): reads up to `WRITE_CHUNK` bytes at a time from the
/// body file, sending each read immediately. A short read before EOF
/// would be silently treated as EOF by `tokio::fs::File`, so the
/// declared length is tracked and any shortfall fails the task with a
/// "chunk data to send" error.
async fn spool_file_to_conn(conn: &mut CachedConn, path: &std::path::Path, deadline: Instant) -> Result<u64> {
    let declared = tokio::fs::metadata(path).await.map_err(Error::from)?.len();
    let mut file = tokio::fs::File::open(path).await.map_err(Error::from)?;
    let mut sent = 0u64;
    let mut buf = vec![0u8; WRITE_CHUNK];
    while sent < declared {
        let timeout = remaining(deadline).map_err(|_| Error::timeout("write timed out"))?;
        let n = tokio::time::timeout(timeout, file.read(&mut buf))
            .await
            .map_err(|_| Error::timeout("write timed out"))?
            .map_err(Error::from)?;
        if n == 0 {
            return Err(Error::protocol("chunk data to send"));
        }
        write_all_with_deadline(conn, &buf[..n], deadline).await?;
        sent += n as u64;
    }
    Ok(sent)
}

/// How the response body is framed, decided once headers are parsed.
enum Framing {
    Empty,
    ContentLength(u64),
    Chunked,
    /// No content-length and not chunked: read until the peer closes.
    UntilClose,
}

async fn read_response(conn: &mut CachedConn, req: &Request, deadline: Instant) -> Result<(crate::headers::StatusLine, HeaderMap, Vec<u8>, u64)> {
    let mut buf = Vec::new();
    let mut status_line;
    let headers;
    loop {
        let Some(end) = find_headers_end(&buf) else {
            fill_more(conn, &mut buf, deadline).await?;
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        let line_end = head.find("\r\n").unwrap_or(head.len());
        status_line = parse_status_line(&head[..line_end])?;

        if status_line.status.is_informational() {
            // Discard the informational message and keep reading; the
            // final response may already be sitting in `buf` behind it.
            buf.drain(..end);
            continue;
        }

        let block = head[line_end..].trim_start_matches("\r\n");
        headers = parse_header_block(block)?;
        buf.drain(..end);
        break;
    }

    let framing = classify_framing(&status_line.status, req, &headers);
    let mut received = 0u64;
    let body = match framing {
        Framing::Empty => Vec::new(),
        Framing::ContentLength(len) => read_exact_body(conn, buf, len, deadline, &mut received).await?,
        Framing::Chunked => read_chunked_body(conn, buf, &headers, deadline, &mut received).await?,
        Framing::UntilClose => read_until_close(conn, buf, deadline, &mut received).await?,
    };

    let body = if req.decompress && is_gzip(&headers) { inflate(body)? } else { body };
    Ok((status_line, headers, body, received))
}

fn classify_framing(status: &StatusCode, req: &Request, headers: &HeaderMap) -> Framing {
    let empty = status.as_u16() == 204 || req.method == Method::HEAD;
    if empty {
        return Framing::Empty;
    }
    if headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        return Framing::Chunked;
    }
    if let Some(len) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Framing::ContentLength(len);
    }
    Framing::UntilClose
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
}

async fn fill_more(conn: &mut CachedConn, buf: &mut Vec<u8>, deadline: Instant) -> Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    let timeout = remaining(deadline).map_err(|_| Error::timeout("read timed out"))?;
    let n = tokio::time::timeout(timeout, conn.read(&mut chunk))
        .await
        .map_err(|_| Error::timeout("read timed out"))?
        .map_err(Error::from)?;
    if n == 0 {
        return Err(Error::protocol("connection closed before response headers were complete"));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

async fn read_exact_body(conn: &mut CachedConn, mut buf: Vec<u8>, len: u64, deadline: Instant, received: &mut u64) -> Result<Vec<u8>> {
    while (buf.len() as u64) < len {
        fill_more(conn, &mut buf, deadline).await?;
    }
    buf.truncate(len as usize);
    *received += buf.len() as u64;
    Ok(buf)
}

async fn read_chunked_body(conn: &mut CachedConn, mut buf: Vec<u8>, headers: &HeaderMap, deadline: Instant, received: &mut u64) -> Result<Vec<u8>> {
    let has_trailers = headers.contains_key(http::header::TRAILER);
    let mut decoder = ChunkedDecoder::new(has_trailers);
    let mut out = Vec::new();
    loop {
        let consumed = decoder.feed(&buf)?;
        buf.drain(..consumed);
        out.extend(decoder.take_output());
        if decoder.is_done() {
            break;
        }
        fill_more(conn, &mut buf, deadline).await?;
    }
    *received += out.len() as u64;
    Ok(out)
}

/// Connection-close framing is only a success if EOF was actually
/// reached, not merely a read error.
async fn read_until_close(conn: &mut CachedConn, mut buf: Vec<u8>, deadline: Instant, received: &mut u64) -> Result<Vec<u8>> {
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let timeout = remaining(deadline).map_err(|_| Error::timeout("read timed out"))?;
        let n = tokio::time::timeout(timeout, conn.read(&mut chunk))
            .await
            .map_err(|_| Error::timeout("read timed out"))?
            .map_err(Error::from)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    *received += buf.len() as u64;
    Ok(buf)
}

fn inflate(compressed: Vec<u8>) -> Result<Vec<u8>> {
    let mut decoder = flate2::write::GzDecoder::new(Vec::new());
    decoder
        .write_all(&compressed)
        .map_err(|e| Error::protocol(format!("gzip inflate failed: {e}")))?;
    decoder.finish().map_err(|e| Error::protocol(format!("gzip inflate failed: {e}")))
}

/// The response forbids keep-alive when it asked to close the
/// connection explicitly.
fn forbids_keepalive(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("close"))
}

/// Body classification: an explicit spool sink always wins; otherwise
/// a body that reaches `spool_limit` spills to a temporary file; otherwise
/// binary if gzip-encoded-but-not-inflated, or the caller forced binary, or
/// the content type is a known binary MIME type; otherwise text, decoded
/// using the content-type's charset (UTF-8 fallback).
fn classify_body(req: &Request, headers: &HeaderMap, bytes: Vec<u8>) -> Result<BodyOutput> {
    if let BodySink::File(path) = &req.sink {
        std::fs::write(path, &bytes).map_err(Error::from)?;
        return Ok(BodyOutput::File(path.clone()));
    }

    if req.spool_limit.exceeded_by(bytes.len() as u64) {
        let mut tmp = tempfile::Builder::new()
            .prefix("http.")
            .tempfile()
            .map_err(Error::from)?;
        tmp.write_all(&bytes).map_err(Error::from)?;
        let (_, path) = tmp.keep().map_err(|e| Error::transport(format!("spool file: {e}")))?;
        return Ok(BodyOutput::File(path));
    }

    let content_type = headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let gzip_not_inflated = !req.decompress && is_gzip(headers);
    let is_binary = req.binary
        || gzip_not_inflated
        || content_type
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .is_some_and(|m| is_binary_mime(&m));

    if is_binary {
        return Ok(BodyOutput::Bytes(bytes));
    }

    let charset = content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .and_then(|m| m.get_param("charset").map(|c| c.as_str().to_string()));
    let encoding = charset
        .as_deref()
        .and_then(encoding_rs::Encoding::for_label_no_replacement)
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(&bytes);
    Ok(BodyOutput::Text(text.into_owned()))
}

fn is_binary_mime(mime: &mime::Mime) -> bool {
    match (mime.type_(), mime.subtype()) {
        (mime::TEXT, _) => false,
        (mime::APPLICATION, sub) if sub == "json" || sub == "xml" || sub == "javascript" || sub == "x-www-form-urlencoded" => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_uses_origin_form_without_proxy() {
        let req = Request::get("https://example.test/a?b=1").unwrap();
        assert_eq!(build_request_line(&req), "GET /a?b=1 HTTP/1.1\r\n");
    }

    #[test]
    fn request_line_uses_absolute_form_through_non_tunneling_proxy() {
        let mut req = Request::get("http://example.test/a").unwrap();
        req.proxy = Some(ProxyConfig {
            host: "proxy.test".to_string(),
            port: 3128,
            tunnel: false,
        });
        assert_eq!(build_request_line(&req), "GET http://example.test/a HTTP/1.1\r\n");
    }

    #[test]
    fn normalize_headers_builds_canonical_host_and_closes_without_keepalive() {
        let mut req = Request::get("https://example.test:8443/a").unwrap();
        req.headers.insert(http::header::HOST, HeaderValue::from_static("attacker.test"));
        normalize_headers(&mut req).unwrap();
        assert_eq!(req.headers.get(http::header::HOST).unwrap(), "example.test:8443");
        assert_eq!(req.headers.get(http::header::CONNECTION).unwrap(), "close");
        assert_eq!(req.headers.get(http::header::CONTENT_LENGTH).unwrap(), "0");
        assert!(req.headers.contains_key(http::header::ACCEPT_ENCODING));
        assert!(req.headers.contains_key(http::header::USER_AGENT));
    }

    #[test]
    fn normalize_headers_keeps_connection_open_with_keepalive() {
        let mut req = Request::get("https://example.test/a").unwrap();
        req.keepalive = Duration::from_secs(5);
        normalize_headers(&mut req).unwrap();
        assert!(!req.headers.contains_key(http::header::CONNECTION));
    }

    #[test]
    fn classify_framing_treats_head_as_empty() {
        let req = Request::new(Method::HEAD, RequestUrl::parse("https://example.test/").unwrap());
        let headers = HeaderMap::new();
        assert!(matches!(classify_framing(&StatusCode::OK, &req, &headers), Framing::Empty));
    }

    #[test]
    fn classify_framing_prefers_chunked_over_content_length() {
        let req = Request::get("https://example.test/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert!(matches!(classify_framing(&StatusCode::OK, &req, &headers), Framing::Chunked));
    }

    #[test]
    fn classify_body_decodes_text_as_utf8_by_default() {
        let req = Request::get("https://example.test/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let out = classify_body(&req, &headers, b"hello".to_vec()).unwrap();
        assert!(matches!(out, BodyOutput::Text(s) if s == "hello"));
    }

    #[test]
    fn classify_body_treats_octet_stream_as_binary() {
        let req = Request::get("https://example.test/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        let out = classify_body(&req, &headers, vec![0, 1, 2]).unwrap();
        assert!(matches!(out, BodyOutput::Bytes(b) if b == vec![0, 1, 2]));
    }

    #[test]
    fn classify_body_spools_once_limit_is_reached() {
        let mut req = Request::get("https://example.test/").unwrap();
        req.spool_limit = SpoolLimit(Some(4));
        let headers = HeaderMap::new();
        let out = classify_body(&req, &headers, b"hello world".to_vec()).unwrap();
        let BodyOutput::File(path) = out else {
            panic!("expected a spooled file");
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn classify_body_stays_in_memory_when_spooling_disabled() {
        let mut req = Request::get("https://example.test/").unwrap();
        req.spool_limit = SpoolLimit(None);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let big = vec![b'x'; DEFAULT_SPOOL_LIMIT + 1];
        let out = classify_body(&req, &headers, big).unwrap();
        assert!(matches!(out, BodyOutput::Text(_)));
    }

    #[test]
    fn forbids_keepalive_detects_connection_close() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        assert!(forbids_keepalive(&headers));
        assert!(!forbids_keepalive(&HeaderMap::new()));
    }

    #[test]
    fn cause_for_error_splits_timeout_by_phase() {
        assert_eq!(cause_for_error(&Error::timeout("connect timed out")), "connecttimeout");
        assert_eq!(cause_for_error(&Error::timeout("write timed out")), "writetimeout");
        assert_eq!(cause_for_error(&Error::timeout("tls setup timed out")), "tlssetuptimeout");
        assert_eq!(cause_for_error(&Error::timeout("tls handshake timed out")), "tlsconnecttimeout");
        assert_eq!(cause_for_error(&Error::timeout("deadline already elapsed")), "tasktimeout");
        assert_eq!(cause_for_error(&Error::protocol("bad status line")), "error");
    }
}
