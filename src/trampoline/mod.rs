//! Trampoline generation.
//!
//! A trampoline is a freshly minted entry point for one concrete signature
//! that repacks every incoming argument buffer into a generic argument
//! array and forwards it to a single fixed-shape dispatcher. The pool
//! models the finite executable-thunk arena such machinery lives in: each
//! live trampoline occupies one slot, released when the trampoline drops,
//! and allocation fails once the arena is full.

use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tracing::trace;

use crate::abi::SignatureLayout;
use crate::runtime::{CallError, CallFrame, EntryPoint, ReturnBytes};
use crate::signature::Signature;

/// Slots available in the default pool. Mirrors a fixed number of
/// executable pages divided into closure-sized thunks.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum TrampolineError {
    #[error("thunk pool exhausted ({capacity} slots in use)")]
    Exhausted { capacity: usize },
}

/// Bounded arena of trampoline slots.
pub struct ThunkPool {
    capacity: usize,
    allocated: Mutex<usize>,
}

impl ThunkPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            allocated: Mutex::new(0),
        })
    }

    /// The process-wide pool used when callers do not supply their own.
    pub fn global() -> &'static Arc<ThunkPool> {
        static POOL: OnceLock<Arc<ThunkPool>> = OnceLock::new();
        POOL.get_or_init(|| ThunkPool::new(DEFAULT_CAPACITY))
    }

    /// Claim one slot. The slot frees itself on drop.
    pub fn allocate(self: &Arc<Self>) -> Result<ThunkSlot, TrampolineError> {
        let mut allocated = self.allocated.lock().unwrap();
        if *allocated >= self.capacity {
            return Err(TrampolineError::Exhausted {
                capacity: self.capacity,
            });
        }
        *allocated += 1;
        Ok(ThunkSlot {
            pool: Arc::clone(self),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        *self.allocated.lock().unwrap()
    }
}

/// Ownership of one pool slot; held alive by the trampoline closure.
pub struct ThunkSlot {
    pool: Arc<ThunkPool>,
}

impl Drop for ThunkSlot {
    fn drop(&mut self) {
        let mut allocated = self.pool.allocated.lock().unwrap();
        *allocated = allocated.saturating_sub(1);
    }
}

/// Mint a trampoline for `signature`. Every invocation copies the caller's
/// argument buffers into a generic frame carrying the trampoline's own
/// signature and layout, then forwards to `dispatcher`; the dispatcher's
/// return bytes are size-checked against the return descriptor before they
/// travel back to the caller.
pub fn make_trampoline(
    signature: Arc<Signature>,
    layout: Arc<SignatureLayout>,
    slot: ThunkSlot,
    dispatcher: EntryPoint,
) -> EntryPoint {
    Arc::new(move |ctx, incoming| {
        let _ = &slot;
        let expected = layout.args.len();
        if incoming.arity() != expected {
            return Err(CallError::ArityMismatch {
                expected,
                got: incoming.arity(),
            });
        }
        let mut packed = Vec::with_capacity(expected);
        for (index, desc) in layout.args.iter().enumerate() {
            let bytes = incoming.arg_bytes(index);
            if bytes.len() != desc.size {
                return Err(CallError::Failed(format!(
                    "argument {index} buffer is {} bytes, descriptor wants {}",
                    bytes.len(),
                    desc.size
                )));
            }
            packed.push(Box::<[u8]>::from(bytes));
        }
        let frame = CallFrame::from_raw(
            Arc::clone(&signature),
            Arc::clone(&layout),
            packed,
        );
        trace!(signature = %signature, "trampoline forwarding to dispatcher");
        let ret = dispatcher(ctx, &frame)?;
        if ret.len() != layout.ret.size {
            return Err(CallError::Failed(format!(
                "dispatcher returned {} bytes, descriptor wants {}",
                ret.len(),
                layout.ret.size
            )));
        }
        Ok(ret)
    })
}

/// Convenience: allocate from `pool` and mint in one step.
pub fn trampoline_in(
    pool: &Arc<ThunkPool>,
    signature: Arc<Signature>,
    layout: Arc<SignatureLayout>,
    dispatcher: EntryPoint,
) -> Result<EntryPoint, TrampolineError> {
    let slot = pool.allocate()?;
    Ok(make_trampoline(signature, layout, slot, dispatcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Value;
    use crate::runtime::CallCtx;
    use crate::block::Capture;

    fn sig(encoding: &str) -> (Arc<Signature>, Arc<SignatureLayout>) {
        let signature = Arc::new(Signature::from_encoding(encoding).unwrap());
        let layout = SignatureLayout::cached(&signature).unwrap();
        (signature, layout)
    }

    fn doubling_dispatcher() -> EntryPoint {
        Arc::new(|_ctx, frame| {
            let x: i32 = frame.arg_as(2)?;
            Ok(ReturnBytes::encode(&Value::I32(x * 2), frame.layout())?)
        })
    }

    #[test]
    fn forwards_arguments_and_return_bytes() {
        let pool = ThunkPool::new(4);
        let (signature, layout) = sig("i@:i");
        let entry = trampoline_in(
            &pool,
            Arc::clone(&signature),
            Arc::clone(&layout),
            doubling_dispatcher(),
        )
        .unwrap();

        let frame = CallFrame::from_values(
            signature,
            Arc::clone(&layout),
            &[Value::Ptr(7), Value::Ptr(1), Value::I32(21)],
        )
        .unwrap();
        let capture = Capture::None;
        let ctx = CallCtx::for_block(&capture);
        let ret = entry(&ctx, &frame).unwrap();
        assert_eq!(ret.decode(&layout).unwrap(), Value::I32(42));
    }

    #[test]
    fn pool_slots_are_finite_and_released_on_drop() {
        let pool = ThunkPool::new(2);
        let (signature, layout) = sig("v@:");

        let a = trampoline_in(
            &pool,
            Arc::clone(&signature),
            Arc::clone(&layout),
            Arc::new(|_, _| Ok(ReturnBytes::empty())),
        )
        .unwrap();
        let b = trampoline_in(
            &pool,
            Arc::clone(&signature),
            Arc::clone(&layout),
            Arc::new(|_, _| Ok(ReturnBytes::empty())),
        )
        .unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(matches!(
            pool.allocate(),
            Err(TrampolineError::Exhausted { capacity: 2 })
        ));

        drop(a);
        assert_eq!(pool.in_use(), 1);
        let _c = trampoline_in(
            &pool,
            Arc::clone(&signature),
            Arc::clone(&layout),
            Arc::new(|_, _| Ok(ReturnBytes::empty())),
        )
        .unwrap();
        drop(b);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn arity_mismatch_is_rejected_before_dispatch() {
        let pool = ThunkPool::new(1);
        let (signature, layout) = sig("i@:i");
        let entry = trampoline_in(
            &pool,
            Arc::clone(&signature),
            Arc::clone(&layout),
            doubling_dispatcher(),
        )
        .unwrap();

        let (short_sig, short_layout) = sig("v@:");
        let frame = CallFrame::from_values(
            short_sig,
            short_layout,
            &[Value::Ptr(7), Value::Ptr(1)],
        )
        .unwrap();
        let capture = Capture::None;
        let ctx = CallCtx::for_block(&capture);
        assert!(matches!(
            entry(&ctx, &frame),
            Err(CallError::ArityMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn dispatcher_return_size_is_checked() {
        let pool = ThunkPool::new(1);
        let (signature, layout) = sig("i@:");
        let entry = trampoline_in(
            &pool,
            Arc::clone(&signature),
            Arc::clone(&layout),
            // Returns void bytes for an i32 signature.
            Arc::new(|_, _| Ok(ReturnBytes::empty())),
        )
        .unwrap();

        let frame = CallFrame::from_values(
            Arc::clone(&signature),
            Arc::clone(&layout),
            &[Value::Ptr(7), Value::Ptr(1)],
        )
        .unwrap();
        let capture = Capture::None;
        let ctx = CallCtx::for_block(&capture);
        assert!(matches!(entry(&ctx, &frame), Err(CallError::Failed(_))));
    }
}
