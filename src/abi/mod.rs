//! ABI: Calling-Convention Descriptors and Marshalling
//!
//! Turns [`TypeNode`]s into [`ConventionDescriptor`]s: the size, alignment,
//! and (for composites) per-field byte offsets needed to move values into
//! and out of a generic argument buffer. Layout follows the platform's
//! natural alignment rules: every field is aligned to its own alignment,
//! the composite's alignment is the maximum field alignment, and its size
//! is rounded up to that alignment. This must match the host compiler's
//! layout exactly or argument marshalling corrupts data.
//!
//! The module also converts between the dynamic [`Value`] view and the raw
//! byte view laid out by a descriptor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

pub use graft_abi::{ConversionError, Value};

use crate::signature::Signature;
use crate::types::{TypeNode, Width};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConventionError {
    /// The node has no ABI representation in this position (e.g. `void` as
    /// an argument).
    #[error("unsupported type for ABI description: {0}")]
    UnsupportedType(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbiError {
    #[error("value mismatch: expected {expected}, got {got}")]
    ValueMismatch { expected: String, got: String },

    #[error("element count mismatch: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("buffer size mismatch: need {need} bytes, have {have}")]
    BufferSize { need: usize, have: usize },
}

/// Pointer size for the target; selectors, object references and block
/// references are all pointer-sized.
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

// ============================================================================
// Descriptors
// ============================================================================

/// ABI description of one type: its size, alignment, and enough structure
/// to marshal a [`Value`] into or out of raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConventionDescriptor {
    pub size: usize,
    pub align: usize,
    pub kind: DescKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DescKind {
    /// Zero bytes; only valid as a return descriptor.
    Void,
    Int { width: Width, signed: bool },
    Float { width: Width },
    Pointer,
    Callable,
    Composite { fields: Vec<FieldSlot> },
    Array { element: Box<ConventionDescriptor>, count: usize },
}

/// A composite field's descriptor plus its byte offset from the start of
/// the composite.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSlot {
    pub offset: usize,
    pub desc: ConventionDescriptor,
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Describe a type in return position. `void` is allowed (zero bytes, no
/// copy on return).
pub fn describe(node: &TypeNode) -> Result<ConventionDescriptor, ConventionError> {
    match node {
        TypeNode::Void => Ok(ConventionDescriptor {
            size: 0,
            align: 1,
            kind: DescKind::Void,
        }),
        TypeNode::Int { width, signed } => Ok(ConventionDescriptor {
            size: width.bytes(),
            align: width.bytes(),
            kind: DescKind::Int {
                width: *width,
                signed: *signed,
            },
        }),
        TypeNode::Float { width } => match width {
            Width::W32 | Width::W64 => Ok(ConventionDescriptor {
                size: width.bytes(),
                align: width.bytes(),
                kind: DescKind::Float { width: *width },
            }),
            _ => Err(ConventionError::UnsupportedType(node.to_string())),
        },
        TypeNode::Pointer => Ok(ConventionDescriptor {
            size: POINTER_SIZE,
            align: POINTER_SIZE,
            kind: DescKind::Pointer,
        }),
        TypeNode::Callable => Ok(ConventionDescriptor {
            size: POINTER_SIZE,
            align: POINTER_SIZE,
            kind: DescKind::Callable,
        }),
        TypeNode::Composite { fields, .. } => {
            let mut slots = Vec::with_capacity(fields.len());
            let mut offset = 0usize;
            let mut align = 1usize;
            for field in fields {
                let desc = describe_argument(&field.ty)?;
                offset = align_up(offset, desc.align);
                align = align.max(desc.align);
                slots.push(FieldSlot {
                    offset,
                    desc: desc.clone(),
                });
                offset += desc.size;
            }
            // The empty composite is a real zero-sized type: size 0, align 1.
            let size = align_up(offset, align);
            Ok(ConventionDescriptor {
                size,
                align,
                kind: DescKind::Composite { fields: slots },
            })
        }
        TypeNode::Array { element, count } => {
            let elem = describe_argument(element)?;
            Ok(ConventionDescriptor {
                size: elem.size * count,
                align: elem.align,
                kind: DescKind::Array {
                    element: Box::new(elem),
                    count: *count,
                },
            })
        }
    }
}

/// Describe a type in argument or field position, where `void` has no
/// representation.
pub fn describe_argument(node: &TypeNode) -> Result<ConventionDescriptor, ConventionError> {
    if node.is_void() {
        return Err(ConventionError::UnsupportedType(node.to_string()));
    }
    describe(node)
}

// ============================================================================
// Signature layout
// ============================================================================

/// Cached per-signature descriptor list: one descriptor per argument plus
/// the return descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureLayout {
    pub args: Vec<ConventionDescriptor>,
    pub ret: ConventionDescriptor,
}

impl SignatureLayout {
    pub fn of(signature: &Signature) -> Result<Self, ConventionError> {
        let args = signature
            .args()
            .iter()
            .map(describe_argument)
            .collect::<Result<Vec<_>, _>>()?;
        let ret = describe(signature.ret())?;
        Ok(Self { args, ret })
    }

    /// Layouts are pure data derived from the encoding, so they are cached
    /// process-wide keyed by the encoding string and never evicted.
    pub fn cached(signature: &Signature) -> Result<Arc<Self>, ConventionError> {
        static CACHE: OnceLock<Mutex<HashMap<String, Arc<SignatureLayout>>>> = OnceLock::new();
        let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
        if let Some(layout) = cache.lock().unwrap().get(signature.encoding()) {
            return Ok(Arc::clone(layout));
        }
        let layout = Arc::new(Self::of(signature)?);
        let mut guard = cache.lock().unwrap();
        let entry = guard
            .entry(signature.encoding().to_string())
            .or_insert_with(|| Arc::clone(&layout));
        Ok(Arc::clone(entry))
    }
}

// ============================================================================
// Marshalling
// ============================================================================

/// Encode a value into a fresh buffer of exactly the descriptor's size.
pub fn encode_value(value: &Value, desc: &ConventionDescriptor) -> Result<Box<[u8]>, AbiError> {
    let mut buf = vec![0u8; desc.size].into_boxed_slice();
    write_value(value, desc, &mut buf)?;
    Ok(buf)
}

/// Write a value into a buffer slice laid out per the descriptor. The slice
/// must be exactly `desc.size` bytes.
pub fn write_value(
    value: &Value,
    desc: &ConventionDescriptor,
    buf: &mut [u8],
) -> Result<(), AbiError> {
    if buf.len() != desc.size {
        return Err(AbiError::BufferSize {
            need: desc.size,
            have: buf.len(),
        });
    }
    match (&desc.kind, value) {
        (DescKind::Void, _) => Ok(()),
        (DescKind::Int { width, .. }, v) => {
            let raw = int_bits(v, desc)?;
            let bytes = raw.to_ne_bytes();
            buf.copy_from_slice(&bytes[..width.bytes()]);
            Ok(())
        }
        (DescKind::Float { width: Width::W32 }, Value::F32(x)) => {
            buf.copy_from_slice(&x.to_ne_bytes());
            Ok(())
        }
        (DescKind::Float { width: Width::W64 }, Value::F64(x)) => {
            buf.copy_from_slice(&x.to_ne_bytes());
            Ok(())
        }
        (DescKind::Pointer, Value::Ptr(p)) => {
            buf.copy_from_slice(&p.to_ne_bytes());
            Ok(())
        }
        (DescKind::Callable, Value::Callable(p)) => {
            buf.copy_from_slice(&p.to_ne_bytes());
            Ok(())
        }
        (DescKind::Composite { fields }, Value::Composite(values)) => {
            if fields.len() != values.len() {
                return Err(AbiError::ArityMismatch {
                    expected: fields.len(),
                    got: values.len(),
                });
            }
            for (slot, v) in fields.iter().zip(values.iter()) {
                let range = slot.offset..slot.offset + slot.desc.size;
                write_value(v, &slot.desc, &mut buf[range])?;
            }
            Ok(())
        }
        (DescKind::Array { element, count }, Value::Array(items)) => {
            if items.len() != *count {
                return Err(AbiError::ArityMismatch {
                    expected: *count,
                    got: items.len(),
                });
            }
            for (i, item) in items.iter().enumerate() {
                let start = i * element.size;
                write_value(item, element, &mut buf[start..start + element.size])?;
            }
            Ok(())
        }
        (_, other) => Err(AbiError::ValueMismatch {
            expected: format!("{:?}", desc.kind),
            got: other.kind_name().to_string(),
        }),
    }
}

// Extends any integer value to 64 bits for uniform byte copying; the write
// truncates back to the descriptor's width.
fn int_bits(value: &Value, desc: &ConventionDescriptor) -> Result<u64, AbiError> {
    match value {
        Value::I8(x) => Ok(*x as i64 as u64),
        Value::I16(x) => Ok(*x as i64 as u64),
        Value::I32(x) => Ok(*x as i64 as u64),
        Value::I64(x) => Ok(*x as u64),
        Value::U8(x) => Ok(*x as u64),
        Value::U16(x) => Ok(*x as u64),
        Value::U32(x) => Ok(*x as u64),
        Value::U64(x) => Ok(*x),
        other => Err(AbiError::ValueMismatch {
            expected: format!("{:?}", desc.kind),
            got: other.kind_name().to_string(),
        }),
    }
}

/// Decode a buffer laid out per the descriptor back into a value.
pub fn read_value(bytes: &[u8], desc: &ConventionDescriptor) -> Result<Value, AbiError> {
    if bytes.len() != desc.size {
        return Err(AbiError::BufferSize {
            need: desc.size,
            have: bytes.len(),
        });
    }
    match &desc.kind {
        DescKind::Void => Ok(Value::Unit),
        DescKind::Int { width, signed } => {
            let mut raw = [0u8; 8];
            raw[..width.bytes()].copy_from_slice(bytes);
            let unsigned = u64::from_ne_bytes(raw);
            Ok(match (width, signed) {
                (Width::W8, true) => Value::I8(unsigned as u8 as i8),
                (Width::W16, true) => Value::I16(unsigned as u16 as i16),
                (Width::W32, true) => Value::I32(unsigned as u32 as i32),
                (Width::W64, true) => Value::I64(unsigned as i64),
                (Width::W8, false) => Value::U8(unsigned as u8),
                (Width::W16, false) => Value::U16(unsigned as u16),
                (Width::W32, false) => Value::U32(unsigned as u32),
                (Width::W64, false) => Value::U64(unsigned),
            })
        }
        DescKind::Float { width } => match width {
            Width::W32 => Ok(Value::F32(f32::from_ne_bytes(bytes.try_into().unwrap()))),
            Width::W64 => Ok(Value::F64(f64::from_ne_bytes(bytes.try_into().unwrap()))),
            // describe() never builds narrower float descriptors.
            _ => Err(AbiError::ValueMismatch {
                expected: "f32 or f64".to_string(),
                got: format!("f{}", width.bytes() * 8),
            }),
        },
        DescKind::Pointer => Ok(Value::Ptr(usize::from_ne_bytes(bytes.try_into().unwrap()))),
        DescKind::Callable => Ok(Value::Callable(usize::from_ne_bytes(
            bytes.try_into().unwrap(),
        ))),
        DescKind::Composite { fields } => {
            let mut values = Vec::with_capacity(fields.len());
            for slot in fields {
                let field_bytes = &bytes[slot.offset..slot.offset + slot.desc.size];
                values.push(read_value(field_bytes, &slot.desc)?);
            }
            Ok(Value::Composite(values))
        }
        DescKind::Array { element, count } => {
            let mut items = Vec::with_capacity(*count);
            for i in 0..*count {
                let start = i * element.size;
                items.push(read_value(&bytes[start..start + element.size], element)?);
            }
            Ok(Value::Array(items))
        }
    }
}
