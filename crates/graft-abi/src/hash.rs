//! Merkle-style structural hashing for signatures.
//!
//! Type structure is hashed bottom-up: scalars hash a fixed domain tag,
//! compound shapes hash their tag plus the hashes of their components.
//! Field names are not included; a composite's identity is its field
//! structure. Two signatures are structurally equal exactly when their
//! hashes are equal, so hook/target compatibility is an O(1) comparison.

use alloc::vec::Vec;

use sha2::{Digest, Sha256};

#[cfg(feature = "std")]
use alloc::string::String;

/// A 256-bit structural hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SigHash([u8; 32]);

impl SigHash {
    /// Create a SigHash from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Format as hex string (for debugging).
    #[cfg(feature = "std")]
    pub fn to_hex(&self) -> String {
        use alloc::format;
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

// Domain tags keep scalar hashes distinct from compound hashes built over
// the same bytes.
const TAG_SCALAR: u8 = 0x01;
const TAG_COMPOSITE: u8 = 0x02;
const TAG_ARRAY: u8 = 0x03;
const TAG_SIGNATURE: u8 = 0x04;

/// Hash a scalar (leaf) type from its discriminating bytes, e.g. an
/// integer's width and signedness.
pub fn hash_scalar(kind: &[u8]) -> SigHash {
    let mut hasher = Sha256::new();
    hasher.update([TAG_SCALAR]);
    hasher.update(kind);
    SigHash(hasher.finalize().into())
}

/// Hash a composite from its field hashes, in declaration order.
/// An empty slice is valid and yields the empty-composite hash.
pub fn hash_composite(fields: &[SigHash]) -> SigHash {
    let mut hasher = Sha256::new();
    hasher.update([TAG_COMPOSITE]);
    hasher.update((fields.len() as u64).to_le_bytes());
    for field in fields {
        hasher.update(field.as_bytes());
    }
    SigHash(hasher.finalize().into())
}

/// Hash a fixed-length array from its element hash and count.
pub fn hash_array(element: &SigHash, count: u64) -> SigHash {
    let mut hasher = Sha256::new();
    hasher.update([TAG_ARRAY]);
    hasher.update(count.to_le_bytes());
    hasher.update(element.as_bytes());
    SigHash(hasher.finalize().into())
}

/// Hash a whole signature: return hash plus argument hashes in order.
pub fn hash_signature(ret: &SigHash, args: &[SigHash]) -> SigHash {
    let mut hasher = Sha256::new();
    hasher.update([TAG_SIGNATURE]);
    hasher.update(ret.as_bytes());
    hasher.update((args.len() as u64).to_le_bytes());
    for arg in args {
        hasher.update(arg.as_bytes());
    }
    SigHash(hasher.finalize().into())
}

/// Convenience: hash a signature directly from component byte tags, used by
/// callers that have not built intermediate hashes.
pub fn hash_signature_bytes(ret_kind: &[u8], arg_kinds: &[&[u8]]) -> SigHash {
    let ret = hash_scalar(ret_kind);
    let args: Vec<SigHash> = arg_kinds.iter().map(|k| hash_scalar(k)).collect();
    hash_signature(&ret, &args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn scalar_hashes_are_stable_and_distinct() {
        assert_eq!(hash_scalar(b"i32"), hash_scalar(b"i32"));
        assert_ne!(hash_scalar(b"i32"), hash_scalar(b"u32"));
    }

    #[test]
    fn composite_hash_depends_on_field_order() {
        let a = hash_scalar(b"i32");
        let b = hash_scalar(b"f64");
        assert_ne!(hash_composite(&[a, b]), hash_composite(&[b, a]));
    }

    #[test]
    fn empty_composite_differs_from_scalar_and_from_nothing() {
        let empty = hash_composite(&[]);
        assert_ne!(empty, hash_scalar(b""));
        // Nesting one empty composite inside another changes the hash.
        assert_ne!(empty, hash_composite(&[empty]));
    }

    #[test]
    fn array_count_is_part_of_identity() {
        let elem = hash_scalar(b"u8");
        assert_ne!(hash_array(&elem, 4), hash_array(&elem, 8));
    }

    #[test]
    fn signature_hash_separates_ret_from_args() {
        let i = hash_scalar(b"i32");
        let v = hash_scalar(b"void");
        // ret=i32, no args  vs  ret=void, arg=i32
        assert_ne!(hash_signature(&i, &[]), hash_signature(&v, &[i]));
    }

    #[test]
    fn hex_rendering() {
        let h = SigHash::from_bytes([0xab; 32]);
        assert_eq!(h.to_hex().len(), 64);
        assert!(h.to_hex().starts_with("abab"));
    }

    #[test]
    fn signature_bytes_helper_matches_manual_construction() {
        let manual = hash_signature(
            &hash_scalar(b"void"),
            &vec![hash_scalar(b"ptr"), hash_scalar(b"i32")],
        );
        assert_eq!(
            hash_signature_bytes(b"void", &[b"ptr", b"i32"]),
            manual
        );
    }
}
