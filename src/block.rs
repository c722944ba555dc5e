//! Anonymous Callables
//!
//! A [`Block`] is an invocable value rather than a named operation: an entry
//! point, optional signature metadata, and captured state. The captured
//! state is an explicit tagged variant, not an opaque blob: no capture, an
//! inline scalar, or owned state that runs a destructor when the last
//! reference to the block is dropped.
//!
//! Only [`BlockIntrospector`] may replace a block's stored entry point; the
//! hook registry goes through it. Replacement never disturbs the captured
//! state's layout or its destruction behavior.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::abi::{SignatureLayout, Value};
use crate::runtime::{CallCtx, CallError, CallFrame, EntryPoint, ReturnBytes};
use crate::signature::Signature;

/// Captured state of a block.
pub enum Capture {
    /// The block closes over nothing.
    None,
    /// A single scalar captured by value.
    InlineScalar(i64),
    /// Owned state with destructor semantics: dropped exactly once, when
    /// the last reference to the block goes away.
    Owned(Arc<dyn Any + Send + Sync>),
}

impl Capture {
    pub fn scalar(&self) -> Option<i64> {
        match self {
            Capture::InlineScalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Capture::Owned(any) => any.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capture::None => write!(f, "Capture::None"),
            Capture::InlineScalar(v) => write!(f, "Capture::InlineScalar({v})"),
            Capture::Owned(_) => write!(f, "Capture::Owned(..)"),
        }
    }
}

struct BlockInner {
    id: usize,
    signature: Option<String>,
    capture: Capture,
    /// The stored entry point. Swapped only by [`BlockIntrospector`].
    entry: Mutex<EntryPoint>,
}

/// An anonymous callable value. Cloning shares the same underlying block;
/// captured state is dropped when the last clone goes away.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

static NEXT_BLOCK_ID: AtomicUsize = AtomicUsize::new(1);

impl Block {
    /// Create a block. `signature` is the closure-style encoding whose first
    /// argument is the block reference itself (e.g. `"i@?i"` for
    /// `(block, i32) -> i32`); blocks without metadata cannot be invoked
    /// through the typed path or hooked.
    pub fn new(signature: Option<&str>, capture: Capture, body: EntryPoint) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
                signature: signature.map(str::to_string),
                capture,
                entry: Mutex::new(body),
            }),
        }
    }

    /// Process-unique identity; `Value::Callable` carries it.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn capture(&self) -> &Capture {
        &self.inner.capture
    }

    pub fn signature_encoding(&self) -> Option<String> {
        self.inner.signature.clone()
    }

    /// Invoke the block with its declared arguments (the leading block
    /// reference is supplied implicitly).
    pub fn invoke(&self, args: &[Value]) -> Result<Value, CallError> {
        let encoding = self.inner.signature.as_ref().ok_or(CallError::NoSignature)?;
        let signature = Arc::new(
            Signature::closure_from_encoding(encoding)
                .map_err(|e| CallError::Failed(e.to_string()))?,
        );
        let layout = SignatureLayout::cached(&signature)
            .map_err(|e| CallError::Failed(e.to_string()))?;

        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(Value::Callable(self.id()));
        values.extend_from_slice(args);
        let frame = CallFrame::from_values(Arc::clone(&signature), Arc::clone(&layout), &values)?;

        let entry = self.current_entry();
        let ctx = CallCtx::for_block(&self.inner.capture);
        let ret = entry(&ctx, &frame)?;
        ret.decode(&layout)
    }

    fn current_entry(&self) -> EntryPoint {
        Arc::clone(&self.inner.entry.lock().unwrap())
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.inner.id)
            .field("signature", &self.inner.signature)
            .field("capture", &self.inner.capture)
            .finish()
    }
}

/// The single component allowed to read and mutate a block's stored entry
/// point. Everything else goes through it.
pub struct BlockIntrospector;

impl BlockIntrospector {
    /// The block's signature, when it exposes metadata.
    pub fn signature_of(block: &Block) -> Option<Signature> {
        Signature::of_block(block).ok().flatten()
    }

    /// The current raw invocation entry point.
    pub fn entry_point_of(block: &Block) -> EntryPoint {
        block.current_entry()
    }

    /// Replace the stored entry point, leaving captured-state layout and
    /// destruction behavior untouched.
    pub fn replace_entry_point(block: &Block, entry: EntryPoint) {
        *block.inner.entry.lock().unwrap() = entry;
    }
}

/// Convenience for defining block bodies as typed closures: wraps a
/// `Fn(&CallCtx, &CallFrame) -> Result<Value, CallError>` into an entry
/// point that encodes the returned value per the block's return descriptor.
pub fn block_body<F>(body: F) -> EntryPoint
where
    F: Fn(&CallCtx<'_>, &CallFrame) -> Result<Value, CallError> + Send + Sync + 'static,
{
    Arc::new(move |ctx, frame| {
        let value = body(ctx, frame)?;
        Ok(ReturnBytes::encode(&value, frame.layout())?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_capture_block_invokes() {
        let block = Block::new(
            Some("i@?ii"),
            Capture::None,
            block_body(|_, frame| {
                let a: i32 = frame.arg_as(1)?;
                let b: i32 = frame.arg_as(2)?;
                Ok(Value::I32(a + b))
            }),
        );
        assert_eq!(
            block.invoke(&[Value::I32(2), Value::I32(3)]).unwrap(),
            Value::I32(5)
        );
    }

    #[test]
    fn inline_scalar_capture_is_visible_to_the_body() {
        let block = Block::new(
            Some("q@?"),
            Capture::InlineScalar(41),
            block_body(|ctx, _| {
                let captured = ctx.capture.and_then(Capture::scalar).unwrap_or(0);
                Ok(Value::I64(captured + 1))
            }),
        );
        assert_eq!(block.invoke(&[]).unwrap(), Value::I64(42));
    }

    #[test]
    fn owned_capture_runs_destructor_once() {
        use std::sync::atomic::AtomicUsize;

        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let block = Block::new(
            Some("v@?"),
            Capture::Owned(Arc::new(Guard(Arc::clone(&drops)))),
            block_body(|_, _| Ok(Value::Unit)),
        );
        let clone = block.clone();
        block.invoke(&[]).unwrap();
        drop(block);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replacing_the_entry_point_preserves_capture() {
        let block = Block::new(
            Some("q@?"),
            Capture::InlineScalar(7),
            block_body(|ctx, _| Ok(Value::I64(ctx.capture.and_then(Capture::scalar).unwrap_or(0)))),
        );
        assert_eq!(block.invoke(&[]).unwrap(), Value::I64(7));

        let replacement = block_body(|ctx, _| {
            // The replacement still sees the original captured scalar.
            let captured = ctx.capture.and_then(Capture::scalar).unwrap_or(0);
            Ok(Value::I64(captured * 10))
        });
        BlockIntrospector::replace_entry_point(&block, replacement);
        assert_eq!(block.invoke(&[]).unwrap(), Value::I64(70));
        assert_eq!(block.capture().scalar(), Some(7));
    }

    #[test]
    fn signatureless_block_cannot_be_invoked_typed() {
        let block = Block::new(None, Capture::None, block_body(|_, _| Ok(Value::Unit)));
        assert!(matches!(block.invoke(&[]), Err(CallError::NoSignature)));
        assert!(BlockIntrospector::signature_of(&block).is_none());
    }

    #[test]
    fn block_ids_are_unique() {
        let a = Block::new(None, Capture::None, block_body(|_, _| Ok(Value::Unit)));
        let b = Block::new(None, Capture::None, block_body(|_, _| Ok(Value::Unit)));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }
}
