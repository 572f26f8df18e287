//! Wire-level HTTP/3 types: QUIC varints, frame and stream-type encoding,
//! request/response header conversion, and static-table QPACK.
//!
//! This crate has no knowledge of an actual QUIC transport; it only turns
//! bytes into frames and fields and back, so it can be driven either by a
//! live connection or by tests feeding it buffers directly.

pub mod proto;
pub mod qpack;
