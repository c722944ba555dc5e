//! graft-abi: the dynamic value model shared by the graft interception engine.
//!
//! A hooked call carries its arguments and return value without static type
//! information, so both sides of an interception speak in terms of [`Value`]:
//! a tagged runtime value that covers every shape a type encoding can
//! describe (scalars, pointers, callables, composites of unbounded nesting,
//! arrays, and the empty/unit value).
//!
//! The crate also provides [`hash::SigHash`], a SHA-256 Merkle hash over type
//! structure. Two signatures are hook-compatible exactly when their structural
//! hashes match, which turns signature comparison into an O(1) check.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod hash;
mod value;

pub use hash::SigHash;
pub use value::Value;

use alloc::string::String;

/// Error converting between a [`Value`] and a concrete Rust type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The value's runtime tag does not match the requested type.
    TypeMismatch { expected: String, got: String },
    /// A composite or array had a different element count than expected.
    LengthMismatch { expected: usize, got: usize },
}

impl core::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConversionError::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected}, got {got}")
            }
            ConversionError::LengthMismatch { expected, got } => {
                write!(f, "length mismatch: expected {expected} elements, got {got}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConversionError {}
