//! HTTP/1.1 concurrent client: task-queue-driven request execution with
//! keep-alive connection reuse, chunked/gzip response decoding, and a
//! certificate-validation-exception TLS layer. The HTTP/3 server driver
//! lives in the sibling `http3-server` crate; the two share no runtime
//! state.

pub mod chunk;
pub mod chunked_codec;
pub mod client;
pub mod client_log;
pub mod config;
pub mod error;
pub mod headers;
pub mod keepalive;
pub mod task;
pub mod tls;
pub mod url;

pub use chunk::ChunkQueue;
pub use client::{BodyOutput, BodySink, BodySource, HttpClient, HttpResult, ProxyConfig, Request, SpoolLimit};
pub use client_log::{ClientLog, LogEntry};
pub use config::{ClientConfig, IpNetwork, PerServerConfig, ValidationException, ValidationLabel};
pub use error::{Error, Kind, Result};
pub use keepalive::{CachedConn, CloseWaitingEntry, KeepAliveCache};
pub use task::{TaskHandle, TaskQueue, TaskQueuePool, WaitOutcome};
pub use url::RequestUrl;
