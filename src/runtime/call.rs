//! Call representation shared by methods, blocks, trampolines and hooks.
//!
//! Arguments travel as raw byte buffers laid out per the signature's
//! convention descriptors; the typed [`Value`] view is decoded on demand.

use std::sync::Arc;

use thiserror::Error;

use crate::abi::{self, AbiError, ConversionError, SignatureLayout, Value};
use crate::block::Capture;
use crate::runtime::{ObjectId, Runtime};
use crate::signature::Signature;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("object {0:?} does not exist")]
    ObjectNotFound(ObjectId),

    #[error("method {selector:?} not found on class {class}")]
    MethodNotFound { class: String, selector: String },

    #[error("argument count mismatch: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("callable has no signature metadata")]
    NoSignature,

    #[error(transparent)]
    Abi(#[from] AbiError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A method body or hook callback failed. Propagates out of the
    /// intercepted call exactly as if the original body had failed.
    #[error("callee failure: {0}")]
    Failed(String),
}

/// Context threaded through every entry-point invocation: the runtime that
/// owns the receiver (absent for standalone blocks) and the captured state
/// of the block being invoked (absent for methods).
#[derive(Clone, Copy)]
pub struct CallCtx<'a> {
    pub runtime: Option<&'a Runtime>,
    pub capture: Option<&'a Capture>,
}

impl<'a> CallCtx<'a> {
    pub fn for_method(runtime: &'a Runtime) -> Self {
        Self {
            runtime: Some(runtime),
            capture: None,
        }
    }

    pub fn for_block(capture: &'a Capture) -> Self {
        Self {
            runtime: None,
            capture: Some(capture),
        }
    }
}

/// A native-callable entry point. Methods, blocks, and synthesized
/// trampolines all have this shape.
pub type EntryPoint =
    Arc<dyn Fn(&CallCtx<'_>, &CallFrame) -> Result<ReturnBytes, CallError> + Send + Sync>;

/// The raw return slot of a call: empty for void returns and zero-sized
/// composites, descriptor-sized bytes otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnBytes(Box<[u8]>);

impl ReturnBytes {
    pub fn empty() -> Self {
        Self(Box::new([]))
    }

    pub fn from_bytes(bytes: Box<[u8]>) -> Self {
        Self(bytes)
    }

    /// Encode a typed return value per the layout's return descriptor.
    /// A void return ignores the value entirely.
    pub fn encode(value: &Value, layout: &SignatureLayout) -> Result<Self, AbiError> {
        if layout.ret.size == 0 {
            return Ok(Self::empty());
        }
        Ok(Self(abi::encode_value(value, &layout.ret)?))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode back to the typed view. Void returns decode to `Value::Unit`.
    pub fn decode(&self, layout: &SignatureLayout) -> Result<Value, CallError> {
        Ok(abi::read_value(&self.0, &layout.ret)?)
    }
}

/// One in-flight call: the signature, its cached layout, and the argument
/// bytes, one buffer per argument (implicit leading arguments included).
#[derive(Debug)]
pub struct CallFrame {
    signature: Arc<Signature>,
    layout: Arc<SignatureLayout>,
    args: Vec<Box<[u8]>>,
}

impl CallFrame {
    /// Build a frame by marshalling typed values. `values` must cover every
    /// argument, implicit leading arguments included.
    pub fn from_values(
        signature: Arc<Signature>,
        layout: Arc<SignatureLayout>,
        values: &[Value],
    ) -> Result<Self, CallError> {
        if values.len() != signature.arity() {
            return Err(CallError::ArityMismatch {
                expected: signature.arity(),
                got: values.len(),
            });
        }
        let args = values
            .iter()
            .zip(layout.args.iter())
            .map(|(v, d)| abi::encode_value(v, d))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            signature,
            layout,
            args,
        })
    }

    /// Build a frame from already-marshalled buffers (the trampoline's
    /// packed generic argument array).
    pub fn from_raw(
        signature: Arc<Signature>,
        layout: Arc<SignatureLayout>,
        args: Vec<Box<[u8]>>,
    ) -> Self {
        Self {
            signature,
            layout,
            args,
        }
    }

    pub fn signature(&self) -> &Arc<Signature> {
        &self.signature
    }

    pub fn layout(&self) -> &Arc<SignatureLayout> {
        &self.layout
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn arg_bytes(&self, index: usize) -> &[u8] {
        &self.args[index]
    }

    pub fn args_bytes(&self) -> &[Box<[u8]>] {
        &self.args
    }

    /// Decode one argument to the typed view.
    pub fn arg(&self, index: usize) -> Result<Value, CallError> {
        let desc = self
            .layout
            .args
            .get(index)
            .ok_or(CallError::ArityMismatch {
                expected: self.layout.args.len(),
                got: index + 1,
            })?;
        Ok(abi::read_value(&self.args[index], desc)?)
    }

    /// Decode one argument and convert it to a concrete type.
    pub fn arg_as<T>(&self, index: usize) -> Result<T, CallError>
    where
        T: TryFrom<Value, Error = ConversionError>,
    {
        Ok(T::try_from(self.arg(index)?)?)
    }
}
