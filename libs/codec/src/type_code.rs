//! Four-character type codes
//!
//! Every value in a [`Message`](crate::Message) is tagged with a 32-bit code
//! built from four ASCII bytes, most significant first (`'LONG'`, `'CSTR'`).

use std::fmt;

/// 32-bit four-character type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeCode(pub u32);

impl TypeCode {
    pub const BOOL: TypeCode = TypeCode::from_chars(*b"BOOL");
    pub const INT8: TypeCode = TypeCode::from_chars(*b"BYTE");
    pub const INT16: TypeCode = TypeCode::from_chars(*b"SHRT");
    pub const INT32: TypeCode = TypeCode::from_chars(*b"LONG");
    pub const INT64: TypeCode = TypeCode::from_chars(*b"LLNG");
    pub const UINT8: TypeCode = TypeCode::from_chars(*b"UBYT");
    pub const UINT16: TypeCode = TypeCode::from_chars(*b"USHT");
    pub const UINT32: TypeCode = TypeCode::from_chars(*b"ULNG");
    pub const UINT64: TypeCode = TypeCode::from_chars(*b"ULLG");
    pub const FLOAT: TypeCode = TypeCode::from_chars(*b"FLOT");
    pub const DOUBLE: TypeCode = TypeCode::from_chars(*b"DBLE");
    pub const STRING: TypeCode = TypeCode::from_chars(*b"CSTR");
    pub const POINT: TypeCode = TypeCode::from_chars(*b"BPNT");
    pub const RECT: TypeCode = TypeCode::from_chars(*b"RECT");
    pub const MESSAGE: TypeCode = TypeCode::from_chars(*b"MSGG");
    pub const MESSENGER: TypeCode = TypeCode::from_chars(*b"MSNG");
    pub const POINTER: TypeCode = TypeCode::from_chars(*b"PNTR");
    pub const RAW: TypeCode = TypeCode::from_chars(*b"RAWT");
    /// Wildcard accepted by counting and lookup operations
    pub const ANY: TypeCode = TypeCode::from_chars(*b"ANYT");

    pub const fn from_chars(chars: [u8; 4]) -> Self {
        TypeCode(u32::from_be_bytes(chars))
    }

    pub const fn chars(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn is_any(self) -> bool {
        self == TypeCode::ANY
    }

    /// True when `self` selects `other` (identical, or `self` is ANY)
    pub fn matches(self, other: TypeCode) -> bool {
        self.is_any() || self == other
    }
}

impl From<u32> for TypeCode {
    fn from(raw: u32) -> Self {
        TypeCode(raw)
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars = self.chars();
        if chars.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
            write!(f, "'{}'", String::from_utf8_lossy(&chars))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

/// Render a `what` code the same way type codes are rendered
pub fn format_what(what: u32) -> String {
    TypeCode(what).to_string()
}
