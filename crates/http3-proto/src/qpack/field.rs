use std::borrow::Cow;
use std::fmt;

/// A single name/value header field as carried on the wire by QPACK.
///
/// Field names are lowercased ASCII per HTTP/3 convention; this type stores
/// raw bytes and leaves case handling to callers.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct HeaderField {
    pub name: Cow<'static, [u8]>,
    pub value: Cow<'static, [u8]>,
}

impl HeaderField {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        Self {
            name: Cow::Owned(name.into()),
            value: Cow::Owned(value.into()),
        }
    }

    pub fn with_value<V>(&self, value: V) -> Self
    where
        V: Into<Vec<u8>>,
    {
        Self {
            name: self.name.clone(),
            value: Cow::Owned(value.into()),
        }
    }

    /// Approximate size as specified by RFC 9204 Section 3.2.1: the length of
    /// the name and value plus 32 bytes of per-entry overhead.
    pub fn mem_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }

    pub fn into_inner(self) -> (Vec<u8>, Vec<u8>) {
        (self.name.into_owned(), self.value.into_owned())
    }
}

impl<N, V> From<(N, V)> for HeaderField
where
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    fn from((name, value): (N, V)) -> Self {
        HeaderField::new(name.as_ref().to_vec(), value.as_ref().to_vec())
    }
}

impl AsRef<HeaderField> for HeaderField {
    fn as_ref(&self) -> &HeaderField {
        self
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}
