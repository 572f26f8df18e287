//! Prefixed string encoding, RFC 7541 Section 5.2.
//!
//! Only the non-Huffman form is produced on encode. Decode rejects strings
//! whose Huffman bit is set, since no Huffman table is implemented here.

use bytes::{Buf, BufMut};
use std::fmt;

use super::prefix_int;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Error {
    UnexpectedEnd,
    Integer(prefix_int::Error),
    HuffmanUnsupported,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedEnd => write!(f, "unexpected end of prefixed string"),
            Error::Integer(e) => write!(f, "invalid length: {}", e),
            Error::HuffmanUnsupported => write!(f, "huffman-coded string not supported"),
        }
    }
}

impl From<prefix_int::Error> for Error {
    fn from(e: prefix_int::Error) -> Self {
        match e {
            prefix_int::Error::UnexpectedEnd => Error::UnexpectedEnd,
            e => Error::Integer(e),
        }
    }
}

/// Encode `data` behind a prefixed length. `huffman_bit` is the bit mask
/// (within the first byte) reserved for the Huffman flag by the caller's
/// field layout; it is always left clear since no Huffman table exists here.
pub fn encode<W: BufMut>(prefix_bits: u8, huffman_bit: u8, flags: u8, data: &[u8], buf: &mut W) {
    debug_assert_eq!(flags & huffman_bit, 0, "huffman encoding not supported");
    prefix_int::encode(prefix_bits, flags, data.len() as u64, buf);
    buf.put_slice(data);
}

pub fn decode<R: Buf>(prefix_bits: u8, huffman_bit: u8, buf: &mut R) -> Result<Vec<u8>, Error> {
    if !buf.has_remaining() {
        return Err(Error::UnexpectedEnd);
    }
    let first = buf.chunk()[0];
    let huffman = first & huffman_bit != 0;
    let len = prefix_int::decode(prefix_bits, buf)? as usize;
    if huffman {
        return Err(Error::HuffmanUnsupported);
    }
    if buf.remaining() < len {
        return Err(Error::UnexpectedEnd);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = vec![];
        encode(7, 0x80, 0, b"hello", &mut buf);
        let mut cur = std::io::Cursor::new(&buf);
        assert_eq!(decode(7, 0x80, &mut cur).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn rejects_huffman() {
        let mut buf = vec![];
        prefix_int::encode(7, 0x80, 3, &mut buf);
        buf.extend_from_slice(b"abc");
        let mut cur = std::io::Cursor::new(&buf);
        assert_eq!(decode(7, 0x80, &mut cur), Err(Error::HuffmanUnsupported));
    }
}
