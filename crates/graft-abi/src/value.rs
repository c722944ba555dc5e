//! Runtime values passed through intercepted calls.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::ConversionError;

/// A runtime value flowing through an intercepted call.
///
/// `Ptr` and `Callable` carry pointer-sized identities rather than raw
/// addresses: the object runtime hands out opaque ids and resolves them on
/// its side. `Composite` preserves field declaration order and may be empty
/// (a valid zero-sized value).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// The empty value: void returns and zero-sized composites decode to it
    /// only via `Composite(vec![])`; `Unit` itself is the no-return marker.
    Unit,

    // Signed integers
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),

    // Unsigned integers
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),

    // Floating point
    F32(f32),
    F64(f64),

    /// Pointer-sized opaque identity (object references, selectors, raw
    /// pointers, C strings).
    Ptr(usize),

    /// Reference to an anonymous callable (block) by id.
    Callable(usize),

    /// Composite value; fields in declaration order, possibly empty.
    Composite(Vec<Value>),

    /// Fixed-length homogeneous array.
    Array(Vec<Value>),
}

impl Value {
    /// Short tag name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Ptr(_) => "ptr",
            Value::Callable(_) => "callable",
            Value::Composite(_) => "composite",
            Value::Array(_) => "array",
        }
    }

    /// An empty composite (the zero-sized value).
    pub fn empty_composite() -> Self {
        Value::Composite(Vec::new())
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }
}

// ============================================================================
// From implementations for primitives
// ============================================================================

impl From<i8> for Value {
    fn from(v: i8) -> Self { Value::I8(v) }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self { Value::I16(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::I32(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::I64(v) }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self { Value::U8(v) }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self { Value::U16(v) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Value::U32(v) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::U64(v) }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self { Value::F32(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::F64(v) }
}

impl From<()> for Value {
    fn from(_: ()) -> Self { Value::Unit }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// TryFrom implementations for primitives
// ============================================================================

macro_rules! try_from_value {
    ($ty:ty, $variant:ident, $name:expr) => {
        impl TryFrom<Value> for $ty {
            type Error = ConversionError;
            fn try_from(v: Value) -> Result<Self, Self::Error> {
                match v {
                    Value::$variant(x) => Ok(x),
                    other => Err(ConversionError::TypeMismatch {
                        expected: String::from($name),
                        got: format!("{:?}", other),
                    }),
                }
            }
        }
    };
}

try_from_value!(i8, I8, "i8");
try_from_value!(i16, I16, "i16");
try_from_value!(i32, I32, "i32");
try_from_value!(i64, I64, "i64");
try_from_value!(u8, U8, "u8");
try_from_value!(u16, U16, "u16");
try_from_value!(u32, U32, "u32");
try_from_value!(u64, U64, "u64");
try_from_value!(f32, F32, "f32");
try_from_value!(f64, F64, "f64");

impl TryFrom<Value> for () {
    type Error = ConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::Unit | Value::Composite(_) => Ok(()),
            other => Err(ConversionError::TypeMismatch {
                expected: String::from("unit"),
                got: format!("{:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn primitive_round_trips() {
        let v: Value = 42i32.into();
        assert_eq!(i32::try_from(v).unwrap(), 42);

        let v: Value = 3.5f64.into();
        assert_eq!(f64::try_from(v).unwrap(), 3.5);
    }

    #[test]
    fn mismatched_conversion_reports_both_sides() {
        let err = i32::try_from(Value::F64(1.0)).unwrap_err();
        match err {
            ConversionError::TypeMismatch { expected, got } => {
                assert_eq!(expected, "i32");
                assert!(got.contains("F64"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_composite_is_not_unit_but_converts_to_unit() {
        let empty = Value::empty_composite();
        assert!(!empty.is_unit());
        assert_eq!(<()>::try_from(empty), Ok(()));
    }

    #[test]
    fn vec_becomes_array() {
        let v: Value = vec![1i32, 2, 3].into();
        assert_eq!(
            v,
            Value::Array(vec![Value::I32(1), Value::I32(2), Value::I32(3)])
        );
    }
}
