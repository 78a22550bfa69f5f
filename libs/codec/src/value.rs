//! Typed values stored in a message
//!
//! [`MessageData`] maps a Rust type onto a type code and its byte form.
//! Scalars use the host byte order, matching the rest of the wire format.

use crate::type_code::TypeCode;

/// A single stored item: owned bytes, or an opaque pointer when not fixed-size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    pub fixed_size: bool,
    pub data: Vec<u8>,
}

impl FieldValue {
    pub fn owned(data: Vec<u8>) -> Self {
        Self {
            fixed_size: true,
            data,
        }
    }

    pub fn pointer(address: usize) -> Self {
        Self {
            fixed_size: false,
            data: (address as u64).to_ne_bytes().to_vec(),
        }
    }

    /// Pointer bits of a non-fixed-size value
    pub fn as_pointer(&self) -> Option<usize> {
        if self.fixed_size {
            return None;
        }
        let bytes: [u8; 8] = self.data.as_slice().try_into().ok()?;
        Some(u64::from_ne_bytes(bytes) as usize)
    }
}

/// Conversion between a Rust type and a message item
pub trait MessageData: Sized {
    const TYPE_CODE: TypeCode;

    fn to_value(&self) -> FieldValue;

    fn from_value(value: &FieldValue) -> Option<Self>;
}

macro_rules! scalar_data {
    ($($ty:ty => $code:expr),* $(,)?) => {
        $(
            impl MessageData for $ty {
                const TYPE_CODE: TypeCode = $code;

                fn to_value(&self) -> FieldValue {
                    FieldValue::owned(self.to_ne_bytes().to_vec())
                }

                fn from_value(value: &FieldValue) -> Option<Self> {
                    let bytes = value.data.as_slice().try_into().ok()?;
                    Some(<$ty>::from_ne_bytes(bytes))
                }
            }
        )*
    };
}

scalar_data! {
    i8 => TypeCode::INT8,
    i16 => TypeCode::INT16,
    i32 => TypeCode::INT32,
    i64 => TypeCode::INT64,
    u8 => TypeCode::UINT8,
    u16 => TypeCode::UINT16,
    u32 => TypeCode::UINT32,
    u64 => TypeCode::UINT64,
    f32 => TypeCode::FLOAT,
    f64 => TypeCode::DOUBLE,
}

impl MessageData for bool {
    const TYPE_CODE: TypeCode = TypeCode::BOOL;

    fn to_value(&self) -> FieldValue {
        FieldValue::owned(vec![*self as u8])
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value.data.as_slice() {
            [byte] => Some(*byte != 0),
            _ => None,
        }
    }
}

/// Strings are stored NUL-terminated
impl MessageData for String {
    const TYPE_CODE: TypeCode = TypeCode::STRING;

    fn to_value(&self) -> FieldValue {
        let mut data = Vec::with_capacity(self.len() + 1);
        data.extend_from_slice(self.as_bytes());
        data.push(0);
        FieldValue::owned(data)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        let bytes = value.data.strip_suffix(&[0u8]).unwrap_or(&value.data[..]);
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl MessageData for Vec<u8> {
    const TYPE_CODE: TypeCode = TypeCode::RAW;

    fn to_value(&self) -> FieldValue {
        FieldValue::owned(self.clone())
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        Some(value.data.clone())
    }
}

/// 2D coordinate, the conventional payload of the `where` field
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl MessageData for Point {
    const TYPE_CODE: TypeCode = TypeCode::POINT;

    fn to_value(&self) -> FieldValue {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&self.x.to_ne_bytes());
        data.extend_from_slice(&self.y.to_ne_bytes());
        FieldValue::owned(data)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        let floats = read_f32s::<2>(&value.data)?;
        Some(Point::new(floats[0], floats[1]))
    }
}

/// Axis-aligned rectangle given by its edges
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

impl MessageData for Rect {
    const TYPE_CODE: TypeCode = TypeCode::RECT;

    fn to_value(&self) -> FieldValue {
        let mut data = Vec::with_capacity(16);
        for edge in [self.left, self.top, self.right, self.bottom] {
            data.extend_from_slice(&edge.to_ne_bytes());
        }
        FieldValue::owned(data)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        let [left, top, right, bottom] = read_f32s::<4>(&value.data)?;
        Some(Rect::new(left, top, right, bottom))
    }
}

fn read_f32s<const N: usize>(data: &[u8]) -> Option<[f32; N]> {
    if data.len() != N * 4 {
        return None;
    }
    let mut out = [0f32; N];
    for (slot, chunk) in out.iter_mut().zip(data.chunks_exact(4)) {
        *slot = f32::from_ne_bytes(chunk.try_into().ok()?);
    }
    Some(out)
}

/// Opaque in-process address; the message never dereferences or frees it
///
/// The pointer bits survive flattening but only mean something inside the
/// process that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawPointer(pub usize);

impl MessageData for RawPointer {
    const TYPE_CODE: TypeCode = TypeCode::POINTER;

    fn to_value(&self) -> FieldValue {
        FieldValue::pointer(self.0)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_pointer().map(RawPointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_is_nul_terminated() {
        let value = "hi".to_string().to_value();
        assert_eq!(value.data, b"hi\0");
        assert_eq!(String::from_value(&value).as_deref(), Some("hi"));
    }

    #[test]
    fn test_scalar_size_mismatch_is_rejected() {
        let value = 7i64.to_value();
        assert_eq!(i32::from_value(&value), None);
        assert_eq!(i64::from_value(&value), Some(7));
    }

    #[test]
    fn test_pointer_is_not_fixed_size() {
        let value = RawPointer(0xdead_beef).to_value();
        assert!(!value.fixed_size);
        assert_eq!(RawPointer::from_value(&value), Some(RawPointer(0xdead_beef)));
        assert_eq!(FieldValue::owned(vec![0; 8]).as_pointer(), None);
    }

    #[test]
    fn test_rect_and_point() {
        let rect = Rect::new(1.0, 2.0, 3.5, 4.5);
        assert_eq!(Rect::from_value(&rect.to_value()), Some(rect));
        let point = Point::new(-1.0, 8.25);
        assert_eq!(Point::from_value(&point.to_value()), Some(point));
        assert_eq!(Point::from_value(&rect.to_value()), None);
    }
}
