//! Graft: an in-process call-interception engine
//!
//! Graft parses compact type encodings into signature trees, derives
//! calling-convention layouts from them, mints trampolines that funnel
//! arbitrary signatures through one fixed dispatcher, and maintains hook
//! chains (before / instead / after) over method and block entry points.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Hook Registry                  │
//! │                                             │
//! │  encoding   - Type-encoding parsing         │
//! │  signature  - Signature model + digests     │
//! │  abi        - Convention descriptors        │
//! │  trampoline - Thunk pool + dispatch bridge  │
//! │  runtime    - Host classes and objects      │
//! │  block      - Callable introspection        │
//! │                                             │
//! ├─────────────────────────────────────────────┤
//! │        Entry points (methods, blocks)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Encodings
//!
//! Signatures travel as compact strings, return type first:
//!
//! ```text
//! i@:ii        (receiver, selector, i32, i32) -> i32
//! v@:{Pt=dd}   (receiver, selector, {Pt=dd}) -> void
//! ```

pub mod abi;
pub mod block;
pub mod encoding;
pub mod hook;
pub mod runtime;
pub mod signature;
pub mod trampoline;
pub mod types;

pub use abi::{SignatureLayout, Value};
pub use block::{Block, BlockIntrospector, Capture};
pub use hook::{HookClosure, HookError, HookMode, HookRegistry, HookToken};
pub use runtime::{ClassId, ObjectId, Runtime};
pub use signature::Signature;
pub use types::TypeNode;
