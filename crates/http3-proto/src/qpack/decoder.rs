use bytes::Buf;
use std::fmt;

use super::block::{HeaderBlockField, HeaderPrefix, Indexed, LiteralWithNameRef};
use super::field::HeaderField;
use super::parse_error::ParseError;
use super::static_::{Error as StaticError, StaticTable};
use super::{prefix_int, prefix_string};

#[derive(Debug, PartialEq)]
pub enum Error {
    InvalidInteger(prefix_int::Error),
    InvalidString(prefix_string::Error),
    InvalidStaticIndex(usize),
    UnknownPrefix(u8),
    MissingRefs(usize),
    BadBaseIndex(isize),
    UnexpectedEnd,
    HeaderTooLong(u64),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInteger(e) => write!(f, "invalid integer: {}", e),
            Error::InvalidString(e) => write!(f, "invalid string: {:?}", e),
            Error::InvalidStaticIndex(i) => write!(f, "unknown static index: {}", i),
            Error::UnknownPrefix(p) => write!(f, "unknown instruction code: 0x{:x}", p),
            Error::MissingRefs(n) => write!(f, "field references the dynamic table ({} refs)", n),
            Error::BadBaseIndex(i) => write!(f, "out of bounds base index: {}", i),
            Error::UnexpectedEnd => write!(f, "unexpected end"),
            Error::HeaderTooLong(_) => write!(f, "header too long"),
        }
    }
}

/// A decoder-stream acknowledgement, sent back to the peer's encoder after a
/// field section referencing the dynamic table has been fully processed.
///
/// This engine never inserts into the dynamic table it advertises (it
/// negotiates zero dynamic table capacity), so this is emitted only to keep
/// the decoder-stream instruction vocabulary available to callers that
/// interoperate with peers expecting it; no caller in this crate produces
/// field sections requiring a real acknowledgement.
pub fn ack_header<W: bytes::BufMut>(stream_id: u64, decoder: &mut W) {
    prefix_int::encode(7, 0b1000_0000, stream_id, decoder);
}

pub fn stream_canceled<W: bytes::BufMut>(stream_id: u64, decoder: &mut W) {
    prefix_int::encode(6, 0b0100_0000, stream_id, decoder);
}

#[derive(PartialEq, Debug)]
pub struct Decoded {
    /// The decoded fields
    pub fields: Vec<HeaderField>,
    /// Whether one or more encoded fields were referencing the dynamic table
    pub dyn_ref: bool,
    /// Decoded size, calculated as stated in "4.1.1.3. Header Size Constraints"
    pub mem_size: u64,
}

/// Decode field lines received on a request or push stream.
///
/// This engine's peers always negotiate a zero-capacity QPACK dynamic table
/// (see the encoder side), so every field section is decodable without
/// tracking encoder-stream state: any reference to the dynamic table is a
/// protocol violation from a peer that ignored that negotiation.
/// https://www.rfc-editor.org/rfc/rfc9204.html#name-field-line-representations
pub fn decode_stateless<T: Buf>(buf: &mut T, max_size: u64) -> Result<Decoded, Error> {
    let (required_ref, _base) = HeaderPrefix::decode(buf)?.get(0, 0)?;

    if required_ref > 0 {
        return Err(Error::MissingRefs(required_ref));
    }

    let mut mem_size = 0;
    let mut fields = Vec::new();
    while buf.has_remaining() {
        let field = match HeaderBlockField::decode(buf.chunk()[0]) {
            HeaderBlockField::IndexedWithPostBase => return Err(Error::MissingRefs(0)),
            HeaderBlockField::LiteralWithPostBaseNameRef => return Err(Error::MissingRefs(0)),
            HeaderBlockField::Indexed => match Indexed::decode(buf)? {
                Indexed::Static(index) => StaticTable::get(index)?.clone(),
                Indexed::Dynamic(_) => return Err(Error::MissingRefs(0)),
            },
            HeaderBlockField::LiteralWithNameRef => match LiteralWithNameRef::decode(buf)? {
                LiteralWithNameRef::Dynamic { .. } => return Err(Error::MissingRefs(0)),
                LiteralWithNameRef::Static { index, value } => {
                    StaticTable::get(index)?.with_value(value)
                }
            },
            HeaderBlockField::Literal => {
                let literal = super::block::Literal::decode(buf)?;
                HeaderField::new(literal.name, literal.value)
            }
        };
        mem_size += field.mem_size() as u64;
        // Cancel decoding if the header is considered too big
        if mem_size > max_size {
            return Err(Error::HeaderTooLong(mem_size));
        }
        fields.push(field);
    }

    Ok(Decoded {
        fields,
        mem_size,
        dyn_ref: false,
    })
}

impl From<prefix_int::Error> for Error {
    fn from(e: prefix_int::Error) -> Self {
        match e {
            prefix_int::Error::UnexpectedEnd => Error::UnexpectedEnd,
            e => Error::InvalidInteger(e),
        }
    }
}

impl From<prefix_string::Error> for Error {
    fn from(e: prefix_string::Error) -> Self {
        match e {
            prefix_string::Error::UnexpectedEnd => Error::UnexpectedEnd,
            e => Error::InvalidString(e),
        }
    }
}

impl From<StaticError> for Error {
    fn from(e: StaticError) -> Self {
        match e {
            StaticError::Unknown(i) => Error::InvalidStaticIndex(i),
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Integer(x) => Error::InvalidInteger(x),
            ParseError::String(x) => Error::InvalidString(x),
            ParseError::InvalidPrefix(p) => Error::UnknownPrefix(p),
            ParseError::InvalidBase(b) => Error::BadBaseIndex(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_too_long() {
        let mut trailers = http::HeaderMap::new();
        trailers.insert("trailer", "value".parse().unwrap());
        trailers.insert("trailer2", "value2".parse().unwrap());
        let mut buf = bytes::BytesMut::new();
        let _ = crate::qpack::encode_stateless(
            &mut buf,
            [
                HeaderField::new("trailer", "value"),
                HeaderField::new("trailer2", "value2"),
            ],
        );
        let result = decode_stateless(&mut buf, 2);
        assert_eq!(result, Err(Error::HeaderTooLong(44)));
    }

    #[test]
    fn round_trip_static_and_literal() {
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new("x-custom", "value"),
        ];
        let mut buf = bytes::BytesMut::new();
        crate::qpack::encode_stateless(&mut buf, fields.clone()).unwrap();
        let decoded = decode_stateless(&mut buf, u64::MAX).unwrap();
        assert_eq!(decoded.fields, fields);
        assert!(!decoded.dyn_ref);
    }

    #[test]
    fn rejects_dynamic_reference() {
        let mut buf = vec![];
        HeaderPrefix::new(1, 1, 1, 4096).encode(&mut buf);
        Indexed::Dynamic(0).encode(&mut buf);
        let mut cur = std::io::Cursor::new(&buf);
        assert_eq!(decode_stateless(&mut cur, u64::MAX), Err(Error::MissingRefs(1)));
    }
}
