//! Unified Type Model
//!
//! A [`TypeNode`] is the structured form of one type encoding: the parser
//! produces it, the convention layer derives ABI descriptors from it, and
//! signatures are ordered lists of it.
//!
//! Key design decisions:
//! - **Structural identity** - two nodes are equal iff their shapes are equal;
//!   composite field names are carried for diagnostics but excluded from
//!   equality and hashing
//! - **Immutable once parsed** - nodes are plain data, freely shareable
//! - **Empty composites are valid** - a zero-field composite is a real
//!   zero-sized type, not an error

use serde::{Deserialize, Serialize};

use graft_abi::hash::{self, SigHash};

/// Integer width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }
}

/// The structured form of one type encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TypeNode {
    /// No value; only valid in return position.
    Void,

    /// Integer with explicit width and signedness.
    Int { width: Width, signed: bool },

    /// IEEE floating point; only 32- and 64-bit widths exist.
    Float { width: Width },

    /// Pointer-sized opaque reference (object, selector, raw pointer).
    Pointer,

    /// Anonymous callable (block) reference.
    Callable,

    /// Composite with fields in declaration order; may be empty.
    Composite { name: Option<String>, fields: Vec<Field> },

    /// Fixed-length homogeneous array.
    Array { element: Box<TypeNode>, count: usize },
}

/// One composite field. The name, when present, is diagnostic only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeNode,
}

impl Field {
    pub fn unnamed(ty: TypeNode) -> Self {
        Self { name: None, ty }
    }

    pub fn named(name: impl Into<String>, ty: TypeNode) -> Self {
        Self {
            name: Some(name.into()),
            ty,
        }
    }
}

impl TypeNode {
    pub fn int(width: Width, signed: bool) -> Self {
        TypeNode::Int { width, signed }
    }

    pub fn float(width: Width) -> Self {
        TypeNode::Float { width }
    }

    /// An unnamed composite.
    pub fn composite(fields: Vec<Field>) -> Self {
        TypeNode::Composite { name: None, fields }
    }

    /// A named composite.
    pub fn named_composite(name: impl Into<String>, fields: Vec<Field>) -> Self {
        TypeNode::Composite {
            name: Some(name.into()),
            fields,
        }
    }

    pub fn array(element: TypeNode, count: usize) -> Self {
        TypeNode::Array {
            element: Box::new(element),
            count,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeNode::Void)
    }

    /// A composite with zero fields: a valid zero-sized type.
    pub fn is_empty_composite(&self) -> bool {
        matches!(self, TypeNode::Composite { fields, .. } if fields.is_empty())
    }

    /// Structural equality, ignoring composite and field names.
    ///
    /// Iterative over an explicit work list so that pathologically deep
    /// nesting cannot overflow the stack.
    pub fn structurally_equal(&self, other: &TypeNode) -> bool {
        let mut work = vec![(self, other)];
        while let Some((a, b)) = work.pop() {
            match (a, b) {
                (TypeNode::Void, TypeNode::Void) => {}
                (TypeNode::Pointer, TypeNode::Pointer) => {}
                (TypeNode::Callable, TypeNode::Callable) => {}
                (
                    TypeNode::Int { width: wa, signed: sa },
                    TypeNode::Int { width: wb, signed: sb },
                ) => {
                    if wa != wb || sa != sb {
                        return false;
                    }
                }
                (TypeNode::Float { width: wa }, TypeNode::Float { width: wb }) => {
                    if wa != wb {
                        return false;
                    }
                }
                (
                    TypeNode::Composite { fields: fa, .. },
                    TypeNode::Composite { fields: fb, .. },
                ) => {
                    if fa.len() != fb.len() {
                        return false;
                    }
                    for (x, y) in fa.iter().zip(fb.iter()) {
                        work.push((&x.ty, &y.ty));
                    }
                }
                (
                    TypeNode::Array { element: ea, count: ca },
                    TypeNode::Array { element: eb, count: cb },
                ) => {
                    if ca != cb {
                        return false;
                    }
                    work.push((ea, eb));
                }
                _ => return false,
            }
        }
        true
    }

    /// Render the canonical token encoding for this node, the form
    /// [`crate::encoding::parse`] accepts. Inverse of parsing up to alias
    /// tokens (every pointer flavor renders as `@`).
    pub fn to_encoding(&self) -> String {
        let mut out = String::new();
        self.write_encoding(&mut out);
        out
    }

    fn write_encoding(&self, out: &mut String) {
        match self {
            TypeNode::Void => out.push('v'),
            TypeNode::Int { width, signed: true } => out.push(match width {
                Width::W8 => 'c',
                Width::W16 => 's',
                Width::W32 => 'i',
                Width::W64 => 'q',
            }),
            TypeNode::Int { width, signed: false } => out.push(match width {
                Width::W8 => 'C',
                Width::W16 => 'S',
                Width::W32 => 'I',
                Width::W64 => 'Q',
            }),
            TypeNode::Float { width: Width::W32 } => out.push('f'),
            TypeNode::Float { width: _ } => out.push('d'),
            TypeNode::Pointer => out.push('@'),
            TypeNode::Callable => out.push_str("@?"),
            TypeNode::Composite { name, fields } => {
                out.push('{');
                if let Some(name) = name {
                    out.push_str(name);
                }
                out.push('=');
                for field in fields {
                    field.ty.write_encoding(out);
                }
                out.push('}');
            }
            TypeNode::Array { element, count } => {
                out.push('[');
                out.push_str(&count.to_string());
                element.write_encoding(out);
                out.push(']');
            }
        }
    }

    /// Structural hash of this node, built bottom-up over the same shape
    /// that `structurally_equal` compares.
    ///
    /// Explicit post-order traversal: child hashes accumulate on a value
    /// stack and each composite or array folds its children when they are
    /// all done, so depth is bounded by the heap, not the call stack.
    pub fn sig_hash(&self) -> SigHash {
        enum Step<'a> {
            Visit(&'a TypeNode),
            FoldComposite(usize),
            FoldArray(u64),
        }

        let mut work = vec![Step::Visit(self)];
        let mut done: Vec<SigHash> = Vec::new();
        while let Some(step) = work.pop() {
            match step {
                Step::Visit(node) => match node {
                    TypeNode::Void => done.push(hash::hash_scalar(b"void")),
                    TypeNode::Pointer => done.push(hash::hash_scalar(b"ptr")),
                    TypeNode::Callable => done.push(hash::hash_scalar(b"callable")),
                    TypeNode::Int { width, signed } => {
                        let tag = [b'i', width.bytes() as u8, *signed as u8];
                        done.push(hash::hash_scalar(&tag));
                    }
                    TypeNode::Float { width } => {
                        let tag = [b'f', width.bytes() as u8];
                        done.push(hash::hash_scalar(&tag));
                    }
                    TypeNode::Composite { fields, .. } => {
                        work.push(Step::FoldComposite(fields.len()));
                        for field in fields.iter().rev() {
                            work.push(Step::Visit(&field.ty));
                        }
                    }
                    TypeNode::Array { element, count } => {
                        work.push(Step::FoldArray(*count as u64));
                        work.push(Step::Visit(element));
                    }
                },
                Step::FoldComposite(arity) => {
                    let split = done.len().saturating_sub(arity);
                    let folded = hash::hash_composite(&done[split..]);
                    done.truncate(split);
                    done.push(folded);
                }
                Step::FoldArray(count) => {
                    if let Some(last) = done.last_mut() {
                        *last = hash::hash_array(last, count);
                    }
                }
            }
        }
        // One visit pushes exactly one hash once its folds complete.
        done.pop().unwrap_or_else(|| hash::hash_scalar(b"void"))
    }
}

// The parser accepts arbitrarily deep nesting, so the derived recursive
// drop glue would overflow the stack on pathological trees. Children are
// detached onto an explicit work list and each node frees with at most one
// level of recursion left in it.
impl Drop for TypeNode {
    fn drop(&mut self) {
        fn detach(node: &mut TypeNode, pending: &mut Vec<TypeNode>) {
            match node {
                TypeNode::Composite { fields, .. } => {
                    pending.extend(std::mem::take(fields).into_iter().map(|f| f.ty));
                }
                TypeNode::Array { element, .. } => {
                    pending.push(std::mem::replace(&mut **element, TypeNode::Void));
                }
                _ => {}
            }
        }

        let mut pending = Vec::new();
        detach(self, &mut pending);
        while let Some(mut node) = pending.pop() {
            detach(&mut node, &mut pending);
        }
    }
}

// Equality and hashing delegate to the structural definitions so that nodes
// parsed from differently-named encodings of the same shape compare equal.
impl PartialEq for TypeNode {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_equal(other)
    }
}

impl Eq for TypeNode {}

impl std::hash::Hash for TypeNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.sig_hash().as_bytes());
    }
}

impl std::fmt::Display for TypeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeNode::Void => write!(f, "void"),
            TypeNode::Int { width, signed } => {
                write!(f, "{}{}", if *signed { "i" } else { "u" }, width.bytes() * 8)
            }
            TypeNode::Float { width } => write!(f, "f{}", width.bytes() * 8),
            TypeNode::Pointer => write!(f, "ptr"),
            TypeNode::Callable => write!(f, "callable"),
            TypeNode::Composite { name, fields } => {
                if let Some(name) = name {
                    write!(f, "{name}")?;
                }
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(n) = &field.name {
                        write!(f, "{n}: ")?;
                    }
                    write!(f, "{}", field.ty)?;
                }
                write!(f, "}}")
            }
            TypeNode::Array { element, count } => write!(f, "[{count} x {element}]"),
        }
    }
}
