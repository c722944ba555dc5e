//! Call interception.
//!
//! The registry installs trampolines over method and block entry points and
//! routes every call through a fixed dispatcher that runs the registered
//! hook chains: all `before` hooks in registration order, then either the
//! most recently registered `instead` hook or the original entry point,
//! then all `after` hooks in registration order.
//!
//! Per-instance hooks dispatch through a shared dynamic subclass of the
//! receiver's class (or through the instrumentation alias when one is
//! already installed) so that sibling instances are untouched, and the
//! receiver's presented class never changes.
//!
//! Installation is all-or-nothing: every fallible step (encoding parse,
//! layout computation, signature check, trampoline allocation) happens
//! before the first runtime mutation. Removal restores the saved original
//! entry point once the last hook on a target is gone. Chains are
//! copy-on-write snapshots, so removing a hook from another thread never
//! disturbs a call already in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace};

use crate::abi::{ConventionError, SignatureLayout, Value};
use crate::block::{Block, BlockIntrospector};
use crate::encoding::EncodingError;
use crate::runtime::{
    CallCtx, CallError, CallFrame, ClassId, EntryPoint, ObjectId, ReturnBytes, Runtime,
    RuntimeError,
};
use crate::signature::{Signature, SignatureKind};
use crate::trampoline::{self, ThunkPool, TrampolineError};
use crate::types::TypeNode;

#[derive(Error, Debug)]
pub enum HookError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Convention(#[from] ConventionError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("hook closure signature {found} does not match required {expected}")]
    SignatureMismatch { expected: String, found: String },

    #[error("trampoline allocation failed: thunk pool exhausted")]
    TrampolineAllocationFailed,

    #[error("hook target not found: {0}")]
    TargetNotFound(String),

    #[error("hook was already removed")]
    AlreadyUnhooked,

    #[error("this closure is already installed on the target")]
    DuplicateHook,

    #[error("callable carries no signature metadata")]
    MissingBlockSignature,
}

impl From<TrampolineError> for HookError {
    fn from(_: TrampolineError) -> Self {
        Self::TrampolineAllocationFailed
    }
}

/// Where a hook runs relative to the original entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    Before,
    Instead,
    After,
}

/// Handler body of a hook closure.
pub type Handler = Arc<dyn Fn(&Invocation<'_>) -> Result<Value, CallError> + Send + Sync>;

/// A hook closure: a handler plus the signature it claims to accept. The
/// claimed signature is checked against the target at installation.
#[derive(Clone)]
pub struct HookClosure {
    signature: Arc<Signature>,
    handler: Handler,
}

impl HookClosure {
    pub fn new<F>(encoding: &str, handler: F) -> Result<Self, HookError>
    where
        F: Fn(&Invocation<'_>) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        let signature = Arc::new(Signature::closure_from_encoding(encoding)?);
        SignatureLayout::cached(&signature)?;
        Ok(Self {
            signature,
            handler: Arc::new(handler),
        })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// The call a hook handler observes: the target's frame, plus the saved
/// original entry point when the hook replaces the call.
pub struct Invocation<'a> {
    mode: HookMode,
    ctx: &'a CallCtx<'a>,
    frame: &'a CallFrame,
    original: Option<&'a EntryPoint>,
}

impl Invocation<'_> {
    pub fn mode(&self) -> HookMode {
        self.mode
    }

    pub fn frame(&self) -> &CallFrame {
        self.frame
    }

    /// Decode one target argument (implicit leading arguments included).
    pub fn arg(&self, index: usize) -> Result<Value, CallError> {
        self.frame.arg(index)
    }

    pub fn arg_as<T>(&self, index: usize) -> Result<T, CallError>
    where
        T: TryFrom<Value, Error = crate::abi::ConversionError>,
    {
        self.frame.arg_as(index)
    }

    /// The receiving object, when the target is a method.
    pub fn receiver(&self) -> Option<ObjectId> {
        if self.frame.signature().kind() != SignatureKind::Method {
            return None;
        }
        match self.frame.arg(0) {
            Ok(Value::Ptr(ptr)) => Some(ObjectId::from_ptr(ptr)),
            _ => None,
        }
    }

    /// The selector name of the hooked method, when resolvable.
    pub fn selector(&self) -> Option<String> {
        if self.frame.signature().kind() != SignatureKind::Method {
            return None;
        }
        let runtime = self.ctx.runtime?;
        match self.frame.arg(1) {
            Ok(Value::Ptr(id)) => runtime.selector_name(id),
            _ => None,
        }
    }

    /// The captured state of the hooked block, when the target is a block.
    pub fn capture(&self) -> Option<&crate::block::Capture> {
        self.ctx.capture
    }

    /// Invoke the original entry point with the unmodified frame. Only
    /// available to replacement hooks.
    pub fn call_original(&self) -> Result<Value, CallError> {
        let original = self.require_original()?;
        original(self.ctx, self.frame)?.decode(self.frame.layout())
    }

    /// Invoke the original entry point with substituted explicit arguments;
    /// the implicit leading arguments are carried over from the frame.
    pub fn call_original_with(&self, args: &[Value]) -> Result<Value, CallError> {
        let original = self.require_original()?;
        let implicit = match self.frame.signature().kind() {
            SignatureKind::Method => 2,
            SignatureKind::Closure => 1,
        };
        let arity = self.frame.signature().arity();
        if implicit + args.len() != arity {
            return Err(CallError::ArityMismatch {
                expected: arity - implicit,
                got: args.len(),
            });
        }
        let mut values = Vec::with_capacity(arity);
        for index in 0..implicit {
            values.push(self.frame.arg(index)?);
        }
        values.extend_from_slice(args);
        let frame = CallFrame::from_values(
            Arc::clone(self.frame.signature()),
            Arc::clone(self.frame.layout()),
            &values,
        )?;
        original(self.ctx, &frame)?.decode(self.frame.layout())
    }

    fn require_original(&self) -> Result<&EntryPoint, CallError> {
        self.original.ok_or_else(|| {
            CallError::Failed("original entry point is only available to replacement hooks".into())
        })
    }
}

/// What a hook is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    Method { class: ClassId, selector: String },
    Block { id: usize },
}

impl TargetKey {
    fn describe(&self, runtime: &Runtime) -> String {
        match self {
            TargetKey::Method { class, selector } => {
                let name = runtime
                    .class_name(*class)
                    .unwrap_or_else(|_| format!("{class:?}"));
                format!("{name}.{selector}")
            }
            TargetKey::Block { id } => format!("block#{id}"),
        }
    }
}

/// Proof of one installed hook; pass it back to [`HookRegistry::unhook`].
#[derive(Debug, Clone)]
pub struct HookToken {
    key: TargetKey,
    id: u64,
}

impl HookToken {
    pub fn key(&self) -> &TargetKey {
        &self.key
    }
}

/// Lifecycle of a hooked target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Wrapping,
    Hooked,
    Unwrapping,
}

struct Hook {
    id: u64,
    mode: HookMode,
    closure: HookClosure,
}

type Chain = Arc<Vec<Arc<Hook>>>;

fn chain_with(chain: &Chain, hook: Arc<Hook>) -> Chain {
    let mut hooks = chain.as_ref().clone();
    hooks.push(hook);
    Arc::new(hooks)
}

fn chain_without(chain: &Chain, id: u64) -> Option<Chain> {
    if !chain.iter().any(|h| h.id == id) {
        return None;
    }
    Some(Arc::new(
        chain.iter().filter(|h| h.id != id).cloned().collect(),
    ))
}

struct TargetInner {
    state: TargetState,
    /// Hooks that apply to every call through this target.
    class_chain: Chain,
    /// Per-receiver hooks, populated by instance-scoped installs.
    object_chains: HashMap<ObjectId, Chain>,
}

struct TargetRecord {
    key: TargetKey,
    signature: Arc<Signature>,
    layout: Arc<SignatureLayout>,
    original: EntryPoint,
    /// Whether the hooked class defined the method in its own table before
    /// the wrap. Restoration replaces the local entry when true and removes
    /// the override when false, so an inheriting class (in particular a
    /// shared dynamic subclass) resolves the live superclass entry again.
    original_is_local: bool,
    inner: Mutex<TargetInner>,
}

impl TargetRecord {
    fn receiver_of(&self, frame: &CallFrame) -> Option<ObjectId> {
        if self.signature.kind() != SignatureKind::Method {
            return None;
        }
        match frame.arg(0) {
            Ok(Value::Ptr(ptr)) => Some(ObjectId::from_ptr(ptr)),
            _ => None,
        }
    }
}

/// The fixed dispatcher every trampoline forwards to: snapshot the chains,
/// run befores, run the newest replacement or the original, run afters.
fn dispatch(
    record: &TargetRecord,
    ctx: &CallCtx<'_>,
    frame: &CallFrame,
) -> Result<ReturnBytes, CallError> {
    let merged: Vec<Arc<Hook>> = {
        let inner = record.inner.lock().unwrap();
        let mut merged: Vec<Arc<Hook>> = inner.class_chain.iter().cloned().collect();
        if let Some(receiver) = record.receiver_of(frame) {
            if let Some(chain) = inner.object_chains.get(&receiver) {
                merged.extend(chain.iter().cloned());
            }
        }
        merged
    };

    for hook in merged.iter().filter(|h| h.mode == HookMode::Before) {
        let invocation = Invocation {
            mode: HookMode::Before,
            ctx,
            frame,
            original: None,
        };
        (hook.closure.handler)(&invocation)?;
    }

    let replacement = merged
        .iter()
        .filter(|h| h.mode == HookMode::Instead)
        .max_by_key(|h| h.id);
    let ret = match replacement {
        Some(hook) => {
            trace!(hook = hook.id, "replacement hook takes the call");
            let invocation = Invocation {
                mode: HookMode::Instead,
                ctx,
                frame,
                original: Some(&record.original),
            };
            let value = (hook.closure.handler)(&invocation)?;
            ReturnBytes::encode(&value, &record.layout)?
        }
        None => (record.original)(ctx, frame)?,
    };

    for hook in merged.iter().filter(|h| h.mode == HookMode::After) {
        let invocation = Invocation {
            mode: HookMode::After,
            ctx,
            frame,
            original: None,
        };
        (hook.closure.handler)(&invocation)?;
    }

    Ok(ret)
}

struct TargetEntry {
    record: Arc<TargetRecord>,
    /// Kept so block targets can have their entry point restored.
    block: Option<Block>,
}

/// Shared state behind a [`HookRegistry`]. Dealloc observers hold a weak
/// reference to it so a deallocating object can finish target teardown
/// without keeping the registry alive.
struct RegistryCore {
    runtime: Arc<Runtime>,
    pool: Arc<ThunkPool>,
    next_id: AtomicU64,
    targets: Mutex<HashMap<TargetKey, TargetEntry>>,
}

/// Install point for hooks over a runtime's methods and over blocks.
pub struct HookRegistry {
    core: Arc<RegistryCore>,
}

impl HookRegistry {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_pool(runtime, Arc::clone(ThunkPool::global()))
    }

    pub fn with_pool(runtime: Arc<Runtime>, pool: Arc<ThunkPool>) -> Self {
        Self {
            core: Arc::new(RegistryCore {
                runtime,
                pool,
                next_id: AtomicU64::new(1),
                targets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.core.runtime
    }

    /// The closure signature a hook on `target` must carry: leading
    /// callable (the hook itself), a second callable for replacement hooks
    /// (the original), then every target argument; void return except for
    /// replacement hooks, which return what the target returns.
    pub fn required_closure_signature(target: &Signature, mode: HookMode) -> Signature {
        let mut args = vec![TypeNode::Callable];
        if mode == HookMode::Instead {
            args.push(TypeNode::Callable);
        }
        args.extend(target.args().iter().cloned());
        let ret = if mode == HookMode::Instead {
            target.ret().clone()
        } else {
            TypeNode::Void
        };
        Signature::from_parts(args, ret, SignatureKind::Closure)
    }

    /// Hook every instance of `class` responding to `selector`.
    pub fn hook_all_instances(
        &self,
        class: ClassId,
        selector: &str,
        mode: HookMode,
        closure: HookClosure,
    ) -> Result<HookToken, HookError> {
        let key = TargetKey::Method {
            class,
            selector: selector.to_string(),
        };
        self.hook_method(key, class, selector, None, mode, closure)
    }

    /// Hook `selector` on one object only. Sibling instances keep the
    /// original behavior; the object's presented class is unchanged.
    pub fn hook_instance(
        &self,
        object: ObjectId,
        selector: &str,
        mode: HookMode,
        closure: HookClosure,
    ) -> Result<HookToken, HookError> {
        let actual = self.core.runtime.actual_class_of(object)?;
        // An instrumentation alias is already a private subclass of the
        // origin; hook it in place rather than stacking another subclass.
        let hook_class = if self.core.runtime.is_instrumented(actual) || self.core.runtime.is_dynamic(actual)
        {
            actual
        } else {
            self.core.runtime.dynamic_subclass_for(actual)?
        };
        let key = TargetKey::Method {
            class: hook_class,
            selector: selector.to_string(),
        };
        self.hook_method(key, hook_class, selector, Some(object), mode, closure)
    }

    fn hook_method(
        &self,
        key: TargetKey,
        class: ClassId,
        selector: &str,
        object: Option<ObjectId>,
        mode: HookMode,
        closure: HookClosure,
    ) -> Result<HookToken, HookError> {
        let signature = Signature::of_method(&self.core.runtime, class, selector)?
            .ok_or_else(|| HookError::TargetNotFound(key.describe(&self.core.runtime)))?;
        let signature = Arc::new(signature);
        let layout = SignatureLayout::cached(&signature)?;
        self.check_closure(&signature, mode, &closure)?;

        let mut targets = self.core.targets.lock().unwrap();
        if let Some(entry) = targets.get(&key) {
            let token = self.append_hook(&entry.record, object, mode, closure)?;
            if let Some(object) = object {
                self.redirect_instance(object, class)?;
                self.watch_dealloc(&entry.record, object)?;
            }
            return Ok(token);
        }

        // First hook on this target: wrap the entry point. Whether the
        // class owned the entry is recorded now, before the wrap installs
        // a local override.
        let original_is_local = self.core.runtime.defines_method(class, selector);
        let original = self
            .core
            .runtime
            .lookup_entry(class, selector)
            .ok_or_else(|| HookError::TargetNotFound(key.describe(&self.core.runtime)))?;
        let record = Arc::new(TargetRecord {
            key: key.clone(),
            signature: Arc::clone(&signature),
            layout: Arc::clone(&layout),
            original,
            original_is_local,
            inner: Mutex::new(TargetInner {
                state: TargetState::Wrapping,
                class_chain: Arc::new(Vec::new()),
                object_chains: HashMap::new(),
            }),
        });
        let dispatcher: EntryPoint = {
            let record = Arc::clone(&record);
            Arc::new(move |ctx, frame| dispatch(&record, ctx, frame))
        };
        let trampoline = trampoline::trampoline_in(&self.core.pool, signature, layout, dispatcher)?;
        let token = self.append_hook(&record, object, mode, closure)?;
        self.core.runtime.replace_entry_point(class, selector, trampoline)?;
        record.inner.lock().unwrap().state = TargetState::Hooked;
        if let Some(object) = object {
            self.redirect_instance(object, class)?;
            self.watch_dealloc(&record, object)?;
        }
        debug!(target = %key.describe(&self.core.runtime), "wrapped method entry point");
        targets.insert(key, TargetEntry {
            record,
            block: None,
        });
        Ok(token)
    }

    /// Hook a block. Requires signature metadata on the block.
    pub fn hook_block(
        &self,
        block: &Block,
        mode: HookMode,
        closure: HookClosure,
    ) -> Result<HookToken, HookError> {
        let signature = Arc::new(
            BlockIntrospector::signature_of(block).ok_or(HookError::MissingBlockSignature)?,
        );
        let layout = SignatureLayout::cached(&signature)?;
        self.check_closure(&signature, mode, &closure)?;

        let key = TargetKey::Block { id: block.id() };
        let mut targets = self.core.targets.lock().unwrap();
        if let Some(entry) = targets.get(&key) {
            return self.append_hook(&entry.record, None, mode, closure);
        }

        let record = Arc::new(TargetRecord {
            key: key.clone(),
            signature: Arc::clone(&signature),
            layout: Arc::clone(&layout),
            original: BlockIntrospector::entry_point_of(block),
            original_is_local: true,
            inner: Mutex::new(TargetInner {
                state: TargetState::Wrapping,
                class_chain: Arc::new(Vec::new()),
                object_chains: HashMap::new(),
            }),
        });
        let dispatcher: EntryPoint = {
            let record = Arc::clone(&record);
            Arc::new(move |ctx, frame| dispatch(&record, ctx, frame))
        };
        let trampoline = trampoline::trampoline_in(&self.core.pool, signature, layout, dispatcher)?;
        let token = self.append_hook(&record, None, mode, closure)?;
        BlockIntrospector::replace_entry_point(block, trampoline);
        record.inner.lock().unwrap().state = TargetState::Hooked;
        debug!(block = block.id(), "wrapped block entry point");
        targets.insert(key, TargetEntry {
            record,
            block: Some(block.clone()),
        });
        Ok(token)
    }

    /// Remove one hook. When the last hook on a target goes, the saved
    /// original entry point is restored and the target forgotten.
    pub fn unhook(&self, token: &HookToken) -> Result<(), HookError> {
        let mut targets = self.core.targets.lock().unwrap();
        let entry = targets
            .get(&token.key)
            .ok_or(HookError::AlreadyUnhooked)?;
        let record = Arc::clone(&entry.record);
        let block = entry.block.clone();

        let (removed_object, now_empty) = {
            let mut inner = record.inner.lock().unwrap();
            if inner.state != TargetState::Hooked {
                return Err(HookError::AlreadyUnhooked);
            }
            if let Some(chain) = chain_without(&inner.class_chain, token.id) {
                inner.class_chain = chain;
                let empty =
                    inner.class_chain.is_empty() && inner.object_chains.is_empty();
                (None, empty)
            } else {
                let mut removed = None;
                for (object, chain) in inner.object_chains.iter() {
                    if let Some(chain) = chain_without(chain, token.id) {
                        removed = Some((*object, chain));
                        break;
                    }
                }
                let (object, chain) = removed.ok_or(HookError::AlreadyUnhooked)?;
                if chain.is_empty() {
                    inner.object_chains.remove(&object);
                } else {
                    inner.object_chains.insert(object, chain.clone());
                }
                let object_done = chain.is_empty();
                let empty =
                    inner.class_chain.is_empty() && inner.object_chains.is_empty();
                (object_done.then_some(object), empty)
            }
        };

        // An instance with no remaining hooks drops back to its origin
        // class, unless it sits on an instrumentation alias.
        if let Some(object) = removed_object {
            if let TargetKey::Method { class, .. } = &token.key {
                if self.core.runtime.is_dynamic(*class) && self.core.runtime.exists(object) {
                    let origin = self.core.runtime.origin_of(*class)?;
                    self.core.runtime.set_actual_class(object, origin)?;
                }
            }
        }

        if now_empty {
            record.inner.lock().unwrap().state = TargetState::Unwrapping;
            self.core
                .restore_original(&token.key, &record, block.as_ref())?;
            debug!(target = %token.key.describe(&self.core.runtime), "restored original entry point");
            targets.remove(&token.key);
        }
        Ok(())
    }

    /// True while any hook is installed on the target.
    pub fn is_hooked(&self, key: &TargetKey) -> bool {
        self.core.targets.lock().unwrap().contains_key(key)
    }

    fn check_closure(
        &self,
        target: &Signature,
        mode: HookMode,
        closure: &HookClosure,
    ) -> Result<(), HookError> {
        let required = Self::required_closure_signature(target, mode);
        if !required.structurally_equal(closure.signature()) {
            return Err(HookError::SignatureMismatch {
                expected: required.encoding().to_string(),
                found: closure.signature().encoding().to_string(),
            });
        }
        Ok(())
    }

    fn append_hook(
        &self,
        record: &Arc<TargetRecord>,
        object: Option<ObjectId>,
        mode: HookMode,
        closure: HookClosure,
    ) -> Result<HookToken, HookError> {
        let mut inner = record.inner.lock().unwrap();
        let duplicate = match object {
            None => inner
                .class_chain
                .iter()
                .any(|h| Arc::ptr_eq(&h.closure.handler, &closure.handler)),
            Some(object) => inner
                .object_chains
                .get(&object)
                .map(|chain| {
                    chain
                        .iter()
                        .any(|h| Arc::ptr_eq(&h.closure.handler, &closure.handler))
                })
                .unwrap_or(false),
        };
        if duplicate {
            return Err(HookError::DuplicateHook);
        }
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let hook = Arc::new(Hook { id, mode, closure });
        match object {
            None => inner.class_chain = chain_with(&inner.class_chain, hook),
            Some(object) => {
                let chain = inner.object_chains.entry(object).or_default();
                *chain = chain_with(chain, hook);
            }
        }
        Ok(HookToken {
            key: record.key.clone(),
            id,
        })
    }

    fn redirect_instance(&self, object: ObjectId, hook_class: ClassId) -> Result<(), HookError> {
        if self.core.runtime.actual_class_of(object)? != hook_class {
            self.core.runtime.set_actual_class(object, hook_class)?;
        }
        Ok(())
    }

    /// Purge an object's hooks when it deallocates so its chain does not
    /// outlive it. The observer holds the registry core weakly; when the
    /// purged chain was the target's last interception, the dealloc runs
    /// the same teardown as [`HookRegistry::unhook`].
    fn watch_dealloc(&self, record: &Arc<TargetRecord>, object: ObjectId) -> Result<(), HookError> {
        let mut inner = record.inner.lock().unwrap();
        let chain = inner.object_chains.entry(object).or_default();
        if chain.len() != 1 {
            return Ok(());
        }
        drop(inner);
        let core = Arc::downgrade(&self.core);
        let key = record.key.clone();
        self.core.runtime.add_dealloc_observer(
            object,
            Box::new(move |_, id| {
                if let Some(core) = core.upgrade() {
                    core.purge_object(&key, id);
                }
            }),
        )?;
        Ok(())
    }
}

impl RegistryCore {
    /// Put the saved entry point back. A class that owned the method gets
    /// the saved entry reinstalled; a class that inherited it gets its
    /// override removed so lookup resolves the live chain again.
    fn restore_original(
        &self,
        key: &TargetKey,
        record: &TargetRecord,
        block: Option<&Block>,
    ) -> Result<(), HookError> {
        match key {
            TargetKey::Method { class, selector } => {
                if record.original_is_local {
                    self.runtime.replace_entry_point(
                        *class,
                        selector,
                        Arc::clone(&record.original),
                    )?;
                } else {
                    self.runtime.remove_method(*class, selector)?;
                }
            }
            TargetKey::Block { .. } => {
                if let Some(block) = block {
                    BlockIntrospector::replace_entry_point(block, Arc::clone(&record.original));
                }
            }
        }
        Ok(())
    }

    /// Dealloc path of hook removal: drop the object's chain, and when the
    /// target has no interceptions left, restore the entry point and forget
    /// the target.
    fn purge_object(&self, key: &TargetKey, object: ObjectId) {
        let mut targets = self.targets.lock().unwrap();
        let Some(entry) = targets.get(key) else {
            return;
        };
        let record = Arc::clone(&entry.record);
        let block = entry.block.clone();
        let now_empty = {
            let mut inner = record.inner.lock().unwrap();
            inner.object_chains.remove(&object);
            inner.state == TargetState::Hooked
                && inner.class_chain.is_empty()
                && inner.object_chains.is_empty()
        };
        if now_empty {
            record.inner.lock().unwrap().state = TargetState::Unwrapping;
            if let Err(err) = self.restore_original(key, &record, block.as_ref()) {
                debug!(target = %key.describe(&self.runtime), %err, "entry restore on dealloc failed");
            }
            debug!(target = %key.describe(&self.runtime), "target released with its last object");
            targets.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_closure_signature_per_mode() {
        let target = Signature::from_encoding("i@:ii").unwrap();

        let before = HookRegistry::required_closure_signature(&target, HookMode::Before);
        assert_eq!(before.encoding(), "v@?@@ii");
        assert!(before.ret().is_void());

        let after = HookRegistry::required_closure_signature(&target, HookMode::After);
        assert_eq!(after, before);

        let instead = HookRegistry::required_closure_signature(&target, HookMode::Instead);
        assert_eq!(instead.encoding(), "i@?@?@@ii");
        assert_eq!(instead.ret(), target.ret());
    }

    #[test]
    fn required_signature_matches_the_token_spellings() {
        // Selector and object tokens both reduce to pointers structurally.
        let target = Signature::from_encoding("i@:ii").unwrap();
        let required = HookRegistry::required_closure_signature(&target, HookMode::Before);
        let spelled = Signature::closure_from_encoding("v@?@:ii").unwrap();
        assert!(required.structurally_equal(&spelled));
    }

    #[test]
    fn chains_are_copy_on_write() {
        fn hook(id: u64) -> Arc<Hook> {
            Arc::new(Hook {
                id,
                mode: HookMode::Before,
                closure: HookClosure::new("v@?", |_| Ok(Value::Unit)).unwrap(),
            })
        }

        let empty: Chain = Arc::new(Vec::new());
        let one = chain_with(&empty, hook(1));
        let two = chain_with(&one, hook(2));
        // Earlier snapshots are untouched by later appends and removals.
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 2);

        let removed = chain_without(&two, 1).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, 2);
        assert_eq!(two.len(), 2);
        assert!(chain_without(&two, 99).is_none());
    }
}
