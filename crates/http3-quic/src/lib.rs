//! Transport-agnostic HTTP/3-over-QUIC stream plumbing: the `quic` trait
//! abstraction other crates drive, frame reassembly on top of it, and the
//! `WriteBuf`/stream-type preamble helpers shared by client and server
//! connection code.

pub mod buf;
pub mod error;
pub mod frame;
pub mod quic;
pub mod quinn_impl;
pub mod stream;

pub use error::{Code, Error, ErrorLevel};
