use bytes::BufMut;

use super::block::{HeaderPrefix, Indexed, Literal, LiteralWithNameRef};
use super::parse_error::ParseError;
use super::prefix_int::Error as IntError;
use super::prefix_string::Error as StringError;
use super::static_::StaticTable;
use super::HeaderField;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    InvalidString(StringError),
    InvalidInteger(IntError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidString(e) => write!(f, "could not parse string: {}", e),
            Error::InvalidInteger(e) => write!(f, "could not parse integer: {}", e),
        }
    }
}

/// Encode a field section without using the dynamic table: every field is
/// either a static-table index, a static name reference with a literal
/// value, or fully literal.
///
/// The peers negotiate `SETTINGS_QPACK_MAX_TABLE_CAPACITY = 0`, so the
/// dynamic table is never available and this is the only encode path this
/// engine uses.
pub fn encode_stateless<W, T, H>(block: &mut W, fields: T) -> Result<u64, Error>
where
    W: BufMut,
    T: IntoIterator<Item = H>,
    H: AsRef<HeaderField>,
{
    let mut size = 0;

    HeaderPrefix::new(0, 0, 0, 0).encode(block);
    for field in fields {
        let field = field.as_ref();

        if let Some(index) = StaticTable::find(field) {
            Indexed::Static(index).encode(block);
        } else if let Some(index) = StaticTable::find_name(&field.name) {
            LiteralWithNameRef::new_static(index, field.value.clone()).encode(block)?;
        } else {
            Literal::new(field.name.clone(), field.value.clone()).encode(block)?;
        }

        size += field.mem_size() as u64;
    }
    Ok(size)
}

impl From<StringError> for Error {
    fn from(e: StringError) -> Self {
        Error::InvalidString(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Integer(x) => Error::InvalidInteger(x),
            ParseError::String(x) => Error::InvalidString(x),
            ParseError::InvalidPrefix(_) | ParseError::InvalidBase(_) => {
                unreachable!("encode_stateless never parses wire input")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qpack::decode_stateless;

    #[test]
    fn encode_static() {
        let field = HeaderField::new(":method", "GET");
        let mut block = Vec::new();
        encode_stateless(&mut block, [field]).unwrap();
        let mut cur = std::io::Cursor::new(&block);
        let decoded = decode_stateless(&mut cur, u64::MAX).unwrap();
        assert_eq!(decoded.fields, &[HeaderField::new(":method", "GET")]);
    }

    #[test]
    fn encode_static_nameref() {
        let field = HeaderField::new("location", "/bar");
        let mut block = Vec::new();
        encode_stateless(&mut block, [field.clone()]).unwrap();
        let mut cur = std::io::Cursor::new(&block);
        let decoded = decode_stateless(&mut cur, u64::MAX).unwrap();
        assert_eq!(decoded.fields, &[field]);
    }

    #[test]
    fn encode_literal() {
        let field = HeaderField::new("foo", "bar");
        let mut block = Vec::new();
        encode_stateless(&mut block, [field.clone()]).unwrap();
        let mut cur = std::io::Cursor::new(&block);
        let decoded = decode_stateless(&mut cur, u64::MAX).unwrap();
        assert_eq!(decoded.fields, &[field]);
    }

    #[test]
    fn encode_mixed_fields() {
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new("location", "/bar"),
            HeaderField::new("x-custom", "value"),
        ];
        let expected_size: u64 = fields.iter().map(|f| f.mem_size() as u64).sum();
        let mut block = Vec::new();
        assert_eq!(encode_stateless(&mut block, fields.clone()).unwrap(), expected_size);
        let mut cur = std::io::Cursor::new(&block);
        let decoded = decode_stateless(&mut cur, u64::MAX).unwrap();
        assert_eq!(decoded.fields, fields);
    }
}
