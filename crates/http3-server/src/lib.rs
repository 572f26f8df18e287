//! HTTP/3-over-QUIC server driver: the accept pipeline, per-stream request
//! assembly, and response writer pass. Transport I/O is reached through
//! `http3_quic`'s `quic` trait abstraction; `server::serve` is the one
//! entry point that commits to the concrete `quinn` endpoint.

pub mod config;
pub mod conn;
pub mod header_encode;
pub mod pollset;
pub mod server;
pub mod shared;
pub mod sock;
pub mod stream;

pub use config::H3DriverConfig;
pub use conn::{ConnError, Http3ConnManager};
pub use server::{serve, ServerError};
pub use shared::{SharedState, SharedStream};
pub use sock::{DispatchRequest, RequestBody, Responder, Sock};
