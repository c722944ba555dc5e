//! Signatures
//!
//! A [`Signature`] is the ordered argument types plus the return type of one
//! callable target. A method's two implicit leading arguments (receiver
//! reference and selector) appear as ordinary entries so arity matches the
//! real call; a block's captured-state reference appears the same way as a
//! single leading callable entry.
//!
//! Signatures are immutable and compared structurally, never by identity.

use graft_abi::hash::{self, SigHash};

use crate::block::Block;
use crate::encoding::{self, EncodingError};
use crate::runtime::{ClassId, Runtime};
use crate::types::TypeNode;

/// Whether the encoding came from a method table or from a closure value.
/// The distinction matters only for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Method,
    Closure,
}

#[derive(Debug, Clone)]
pub struct Signature {
    encoding: String,
    args: Vec<TypeNode>,
    ret: TypeNode,
    kind: SignatureKind,
}

impl Signature {
    /// Parse a method signature encoding: return type, then each argument.
    pub fn from_encoding(encoding: &str) -> Result<Self, EncodingError> {
        Self::parse(encoding, SignatureKind::Method)
    }

    /// Parse a closure (hook or block) signature encoding.
    pub fn closure_from_encoding(encoding: &str) -> Result<Self, EncodingError> {
        Self::parse(encoding, SignatureKind::Closure)
    }

    fn parse(encoding: &str, kind: SignatureKind) -> Result<Self, EncodingError> {
        let (ret, args) = encoding::parse_signature(encoding)?;
        Ok(Self {
            encoding: encoding.to_string(),
            args,
            ret,
            kind,
        })
    }

    /// Build a signature from already-parsed parts.
    pub fn from_parts(args: Vec<TypeNode>, ret: TypeNode, kind: SignatureKind) -> Self {
        let mut encoding = ret.to_encoding();
        for arg in &args {
            encoding.push_str(&arg.to_encoding());
        }
        Self {
            encoding,
            args,
            ret,
            kind,
        }
    }

    /// Introspect a live method, resolved through the superclass chain.
    /// `None` when the class does not respond to the selector.
    pub fn of_method(
        runtime: &Runtime,
        class: ClassId,
        selector: &str,
    ) -> Result<Option<Self>, EncodingError> {
        match runtime.method_encoding(class, selector) {
            Some(enc) => Ok(Some(Self::from_encoding(&enc)?)),
            None => Ok(None),
        }
    }

    /// Introspect an anonymous callable. `None` when the block carries no
    /// signature metadata.
    pub fn of_block(block: &Block) -> Result<Option<Self>, EncodingError> {
        match block.signature_encoding() {
            Some(enc) => Ok(Some(Self::closure_from_encoding(&enc)?)),
            None => Ok(None),
        }
    }

    pub fn args(&self) -> &[TypeNode] {
        &self.args
    }

    pub fn ret(&self) -> &TypeNode {
        &self.ret
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn kind(&self) -> SignatureKind {
        self.kind
    }

    /// Structural digest over the return type and each argument in order.
    /// Equal digests mean hook-compatible signatures.
    pub fn digest(&self) -> SigHash {
        let ret = self.ret.sig_hash();
        let args: Vec<SigHash> = self.args.iter().map(TypeNode::sig_hash).collect();
        hash::hash_signature(&ret, &args)
    }

    /// Structural equality: same arity, every element structurally equal,
    /// same return type. `kind` is ignored.
    pub fn structurally_equal(&self, other: &Signature) -> bool {
        self.args.len() == other.args.len()
            && self.ret.structurally_equal(&other.ret)
            && self
                .args
                .iter()
                .zip(other.args.iter())
                .all(|(a, b)| a.structurally_equal(b))
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_equal(other)
    }
}

impl Eq for Signature {}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}
