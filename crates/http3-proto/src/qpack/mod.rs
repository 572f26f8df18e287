//! Static-table QPACK encoding (RFC 9204), used with
//! `SETTINGS_QPACK_MAX_TABLE_CAPACITY` negotiated to zero: every field
//! section is a self-contained, statelessly decodable block, so header
//! decoding never blocks on an encoder-stream instruction arriving out of
//! order.

pub use self::{
    decoder::{ack_header, decode_stateless, stream_canceled, Decoded, Error as DecoderError},
    encoder::{encode_stateless, Error as EncoderError},
    field::HeaderField,
};

mod block;
mod decoder;
mod encoder;
mod field;
mod parse_error;
mod prefix_int;
mod prefix_string;
mod static_;

#[derive(Debug)]
pub enum Error {
    Encoder(EncoderError),
    Decoder(DecoderError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Encoder(e) => write!(f, "Encoder {}", e),
            Error::Decoder(e) => write!(f, "Decoder {}", e),
        }
    }
}
