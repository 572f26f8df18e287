//! Header block field representations, RFC 9204 Section 4.5.

use bytes::{Buf, BufMut};

use super::parse_error::ParseError;
use super::{prefix_int, prefix_string};

const VALUE_HUFFMAN_BIT: u8 = 0b1000_0000;

/// Classifies the first byte of a header block field so the right variant
/// can be decoded.
#[derive(Debug, Eq, PartialEq)]
pub enum HeaderBlockField {
    Indexed,
    IndexedWithPostBase,
    LiteralWithNameRef,
    LiteralWithPostBaseNameRef,
    Literal,
}

impl HeaderBlockField {
    pub fn decode(first: u8) -> Self {
        if first & 0b1000_0000 != 0 {
            HeaderBlockField::Indexed
        } else if first & 0b1100_0000 == 0b0100_0000 {
            HeaderBlockField::LiteralWithNameRef
        } else if first & 0b1110_0000 == 0b0010_0000 {
            HeaderBlockField::Literal
        } else if first & 0b1111_0000 == 0b0001_0000 {
            HeaderBlockField::IndexedWithPostBase
        } else {
            HeaderBlockField::LiteralWithPostBaseNameRef
        }
    }
}

/// The encoded Required Insert Count and Base of a header block, RFC 9204
/// Section 4.5.1.
#[derive(Debug, Eq, PartialEq)]
pub struct HeaderPrefix {
    encoded_insert_count: usize,
    sign_negative: bool,
    delta_base: usize,
}

impl HeaderPrefix {
    /// Prepare a prefix to encode. `required_ref` and `base` are absolute
    /// values; `total_inserted` and `max_table_size` are the dynamic table
    /// state needed to re-derive the encoded (wrapped) insert count.
    pub fn new(required_ref: usize, base: usize, total_inserted: usize, max_table_size: usize) -> Self {
        let max_entries = max_table_size / 32;
        let encoded_insert_count = if required_ref == 0 {
            0
        } else if max_entries == 0 {
            required_ref + 1
        } else {
            (required_ref % (2 * max_entries)) + 1
        };

        let (sign_negative, delta_base) = if base >= required_ref {
            (false, base - required_ref)
        } else {
            (true, required_ref - base - 1)
        };

        let _ = total_inserted;
        Self {
            encoded_insert_count,
            sign_negative,
            delta_base,
        }
    }

    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        prefix_int::encode(8, 0, self.encoded_insert_count as u64, buf);
        let flag = if self.sign_negative { 0b1000_0000 } else { 0 };
        prefix_int::encode(7, flag, self.delta_base as u64, buf);
    }

    pub fn decode<R: Buf>(buf: &mut R) -> Result<Self, ParseError> {
        let encoded_insert_count = prefix_int::decode(8, buf)? as usize;
        if !buf.has_remaining() {
            return Err(prefix_int::Error::UnexpectedEnd.into());
        }
        let sign_negative = buf.chunk()[0] & 0b1000_0000 != 0;
        let delta_base = prefix_int::decode(7, buf)? as usize;
        Ok(Self {
            encoded_insert_count,
            sign_negative,
            delta_base,
        })
    }

    /// Reconstruct `(required_insert_count, base)` from the wire encoding,
    /// given the decoder's view of `total_inserted` and `max_table_size`.
    pub fn get(&self, total_inserted: usize, max_table_size: usize) -> Result<(usize, usize), ParseError> {
        if self.encoded_insert_count == 0 {
            let base = if self.sign_negative {
                return Err(ParseError::InvalidBase(-(self.delta_base as isize) - 1));
            } else {
                self.delta_base
            };
            return Ok((0, base));
        }

        let max_entries = max_table_size / 32;
        if max_entries == 0 {
            return Err(ParseError::InvalidBase(self.encoded_insert_count as isize));
        }
        let full_range = 2 * max_entries;
        if self.encoded_insert_count > full_range {
            return Err(ParseError::InvalidBase(self.encoded_insert_count as isize));
        }

        let max_value = total_inserted + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut required = max_wrapped + self.encoded_insert_count - 1;
        if required > max_value {
            if required < full_range {
                return Err(ParseError::InvalidBase(required as isize));
            }
            required -= full_range;
        }
        if required == 0 {
            return Err(ParseError::InvalidBase(0));
        }

        let base = if self.sign_negative {
            let delta = self.delta_base + 1;
            if delta > required {
                return Err(ParseError::InvalidBase(required as isize - delta as isize));
            }
            required - delta
        } else {
            required + self.delta_base
        };

        Ok((required, base))
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Indexed {
    Static(usize),
    Dynamic(usize),
}

impl Indexed {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        match self {
            Indexed::Static(i) => prefix_int::encode(6, 0b1100_0000, *i as u64, buf),
            Indexed::Dynamic(i) => prefix_int::encode(6, 0b1000_0000, *i as u64, buf),
        }
    }

    pub fn decode<R: Buf>(buf: &mut R) -> Result<Self, ParseError> {
        if !buf.has_remaining() {
            return Err(prefix_int::Error::UnexpectedEnd.into());
        }
        let is_static = buf.chunk()[0] & 0b0100_0000 != 0;
        let index = prefix_int::decode(6, buf)? as usize;
        Ok(if is_static {
            Indexed::Static(index)
        } else {
            Indexed::Dynamic(index)
        })
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct IndexedWithPostBase(pub usize);

impl IndexedWithPostBase {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        prefix_int::encode(4, 0b0001_0000, self.0 as u64, buf);
    }

    pub fn decode<R: Buf>(buf: &mut R) -> Result<Self, ParseError> {
        Ok(Self(prefix_int::decode(4, buf)? as usize))
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum LiteralWithNameRef {
    Static { index: usize, value: Vec<u8> },
    Dynamic { index: usize, value: Vec<u8> },
}

impl LiteralWithNameRef {
    pub fn new_static<V: Into<Vec<u8>>>(index: usize, value: V) -> Self {
        LiteralWithNameRef::Static {
            index,
            value: value.into(),
        }
    }

    pub fn new_dynamic<V: Into<Vec<u8>>>(index: usize, value: V) -> Self {
        LiteralWithNameRef::Dynamic {
            index,
            value: value.into(),
        }
    }

    pub fn encode<W: BufMut>(&self, buf: &mut W) -> Result<(), prefix_string::Error> {
        let (flag, index, value) = match self {
            LiteralWithNameRef::Static { index, value } => (0b0101_0000, *index, value),
            LiteralWithNameRef::Dynamic { index, value } => (0b0100_0000, *index, value),
        };
        prefix_int::encode(4, flag, index as u64, buf);
        prefix_string::encode(7, VALUE_HUFFMAN_BIT, 0, value, buf);
        Ok(())
    }

    pub fn decode<R: Buf>(buf: &mut R) -> Result<Self, ParseError> {
        if !buf.has_remaining() {
            return Err(prefix_int::Error::UnexpectedEnd.into());
        }
        let is_static = buf.chunk()[0] & 0b0001_0000 != 0;
        let index = prefix_int::decode(4, buf)? as usize;
        let value = prefix_string::decode(7, VALUE_HUFFMAN_BIT, buf)?;
        Ok(if is_static {
            LiteralWithNameRef::Static { index, value }
        } else {
            LiteralWithNameRef::Dynamic { index, value }
        })
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct LiteralWithPostBaseNameRef {
    pub index: usize,
    pub value: Vec<u8>,
}

impl LiteralWithPostBaseNameRef {
    pub fn new<V: Into<Vec<u8>>>(index: usize, value: V) -> Self {
        Self {
            index,
            value: value.into(),
        }
    }

    pub fn encode<W: BufMut>(&self, buf: &mut W) -> Result<(), prefix_string::Error> {
        prefix_int::encode(3, 0, self.index as u64, buf);
        prefix_string::encode(7, VALUE_HUFFMAN_BIT, 0, &self.value, buf);
        Ok(())
    }

    pub fn decode<R: Buf>(buf: &mut R) -> Result<Self, ParseError> {
        let index = prefix_int::decode(3, buf)? as usize;
        let value = prefix_string::decode(7, VALUE_HUFFMAN_BIT, buf)?;
        Ok(Self { index, value })
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Literal {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Literal {
    pub fn new<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn encode<W: BufMut>(&self, buf: &mut W) -> Result<(), prefix_string::Error> {
        const NAME_HUFFMAN_BIT: u8 = 0b0000_1000;
        prefix_string::encode(3, NAME_HUFFMAN_BIT, 0b0010_0000, &self.name, buf);
        prefix_string::encode(7, VALUE_HUFFMAN_BIT, 0, &self.value, buf);
        Ok(())
    }

    pub fn decode<R: Buf>(buf: &mut R) -> Result<Self, ParseError> {
        const NAME_HUFFMAN_BIT: u8 = 0b0000_1000;
        let name = prefix_string::decode(3, NAME_HUFFMAN_BIT, buf)?;
        let value = prefix_string::decode(7, VALUE_HUFFMAN_BIT, buf)?;
        Ok(Self { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn indexed_round_trip() {
        let mut buf = vec![];
        Indexed::Static(17).encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        assert_eq!(Indexed::decode(&mut cur), Ok(Indexed::Static(17)));
    }

    #[test]
    fn literal_round_trip() {
        let mut buf = vec![];
        Literal::new("foo", "bar").encode(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        assert_eq!(Literal::decode(&mut cur), Ok(Literal::new("foo", "bar")));
    }

    #[test]
    fn literal_with_name_ref_round_trip() {
        let mut buf = vec![];
        LiteralWithNameRef::new_static(12, "/bar").encode(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        assert_eq!(
            LiteralWithNameRef::decode(&mut cur),
            Ok(LiteralWithNameRef::new_static(12, "/bar"))
        );
    }

    #[test]
    fn header_prefix_zero_round_trip() {
        let mut buf = vec![];
        HeaderPrefix::new(0, 0, 0, 0).encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        let prefix = HeaderPrefix::decode(&mut cur).unwrap();
        assert_eq!(prefix.get(0, 0), Ok((0, 0)));
    }

    #[test]
    fn field_classification() {
        assert_eq!(HeaderBlockField::decode(0b1100_0000), HeaderBlockField::Indexed);
        assert_eq!(HeaderBlockField::decode(0b0101_0000), HeaderBlockField::LiteralWithNameRef);
        assert_eq!(HeaderBlockField::decode(0b0010_0000), HeaderBlockField::Literal);
        assert_eq!(
            HeaderBlockField::decode(0b0001_0000),
            HeaderBlockField::IndexedWithPostBase
        );
        assert_eq!(
            HeaderBlockField::decode(0b0000_0000),
            HeaderBlockField::LiteralWithPostBaseNameRef
        );
    }
}
