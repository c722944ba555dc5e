//! Host Object Runtime
//!
//! A small dynamic object runtime consumed by the interception engine
//! through a narrow interface: class tables with superclass-chain method
//! lookup, entry-point replacement, dynamic subclass creation with an
//! identity-rewrite table (an instance's presented class never changes when
//! its dispatch class does), instrumentation aliases (the transparent
//! subclassing a property-observation mechanism installs), and objects with
//! instance variables and deallocation observers.
//!
//! The engine queries and mutates this facility; it does not own it.

mod call;

pub use call::{CallCtx, CallError, CallFrame, EntryPoint, ReturnBytes};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::abi::{ConventionError, SignatureLayout, Value};
use crate::encoding::EncodingError;
use crate::signature::Signature;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("class {0:?} does not exist")]
    UnknownClass(ClassId),

    #[error("duplicate class name: {0}")]
    DuplicateClass(String),

    #[error("object {0:?} does not exist")]
    UnknownObject(ObjectId),

    #[error("method {selector:?} not found on class {class}")]
    UnknownMethod { class: String, selector: String },

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Convention(#[from] ConventionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The pointer-sized identity used in call frames.
    pub fn to_ptr_value(self) -> Value {
        Value::Ptr(self.0 as usize)
    }

    pub fn from_ptr(ptr: usize) -> Self {
        Self(ptr as u64)
    }
}

/// How a class came to exist. Dynamic subclasses and instrumentation
/// aliases both carry their origin so alias resolution can walk back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassKind {
    Regular,
    /// Synthesized by the hook engine for per-instance dispatch.
    DynamicSubclass { origin: ClassId },
    /// Installed by the observation mechanism; treated as the canonical
    /// class for hooking once present.
    InstrumentationAlias { origin: ClassId },
}

struct MethodEntry {
    encoding: String,
    entry: EntryPoint,
}

struct ClassDef {
    name: String,
    superclass: Option<ClassId>,
    kind: ClassKind,
    methods: HashMap<String, MethodEntry>,
}

/// Runs when an object is deallocated, after its record is gone.
pub type DeallocObserver = Box<dyn FnOnce(&Runtime, ObjectId) + Send>;

struct ObjectRecord {
    /// Dispatch class; may be a dynamic subclass or instrumentation alias.
    class: ClassId,
    /// Identity-rewrite table entry: the class this object publicly reports.
    presented: ClassId,
    ivars: HashMap<String, Value>,
    dealloc_observers: Vec<DeallocObserver>,
}

struct Inner {
    classes: Vec<ClassDef>,
    class_by_name: HashMap<String, ClassId>,
    objects: HashMap<ObjectId, ObjectRecord>,
    next_object: u64,
    selectors: Vec<String>,
    selector_ids: HashMap<String, usize>,
    /// One dynamic subclass per origin class, shared by its hooked instances.
    dynamic_subclasses: HashMap<ClassId, ClassId>,
    /// One instrumentation alias per origin class.
    aliases: HashMap<ClassId, ClassId>,
}

/// The host runtime. Shared via `Arc`; all mutation is behind one lock,
/// which is never held while user code (method bodies, hooks) runs.
pub struct Runtime {
    inner: Mutex<Inner>,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                classes: Vec::new(),
                class_by_name: HashMap::new(),
                objects: HashMap::new(),
                next_object: 1,
                selectors: Vec::new(),
                selector_ids: HashMap::new(),
                dynamic_subclasses: HashMap::new(),
                aliases: HashMap::new(),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    pub fn register_class(
        &self,
        name: &str,
        superclass: Option<ClassId>,
    ) -> Result<ClassId, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.class_by_name.contains_key(name) {
            return Err(RuntimeError::DuplicateClass(name.to_string()));
        }
        if let Some(superclass) = superclass {
            inner
                .classes
                .get(superclass.0 as usize)
                .ok_or(RuntimeError::UnknownClass(superclass))?;
        }
        Ok(inner.push_class(name.to_string(), superclass, ClassKind::Regular))
    }

    pub fn class_named(&self, name: &str) -> Option<ClassId> {
        self.inner.lock().unwrap().class_by_name.get(name).copied()
    }

    pub fn class_name(&self, class: ClassId) -> Result<String, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.class(class)?.name.clone())
    }

    /// Define (or redefine) a method. The encoding is validated eagerly so
    /// malformed definitions fail here, not at call time.
    pub fn define_method(
        &self,
        class: ClassId,
        selector: &str,
        encoding: &str,
        body: EntryPoint,
    ) -> Result<(), RuntimeError> {
        let signature = Signature::from_encoding(encoding)?;
        SignatureLayout::cached(&signature)?;
        let mut inner = self.inner.lock().unwrap();
        inner.intern_selector(selector);
        inner.class_mut(class)?.methods.insert(
            selector.to_string(),
            MethodEntry {
                encoding: encoding.to_string(),
                entry: body,
            },
        );
        Ok(())
    }

    /// True when `class` defines the method in its own table, as opposed to
    /// inheriting it.
    pub fn defines_method(&self, class: ClassId, selector: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .class(class)
            .map(|c| c.methods.contains_key(selector))
            .unwrap_or(false)
    }

    /// Delete a method from `class`'s own table. Lookup on the class falls
    /// back to the superclass chain afterwards.
    pub fn remove_method(&self, class: ClassId, selector: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let def = inner.class_mut(class)?;
        if def.methods.remove(selector).is_none() {
            return Err(RuntimeError::UnknownMethod {
                class: def.name.clone(),
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    /// The encoding string of a method, resolved through the superclass
    /// chain.
    pub fn method_encoding(&self, class: ClassId, selector: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .resolve_method(class, selector)
            .map(|(_, entry)| entry.encoding.clone())
    }

    /// The current entry point of a method, resolved through the
    /// superclass chain.
    pub fn lookup_entry(&self, class: ClassId, selector: &str) -> Option<EntryPoint> {
        let inner = self.inner.lock().unwrap();
        inner
            .resolve_method(class, selector)
            .map(|(_, entry)| Arc::clone(&entry.entry))
    }

    /// Install a new entry point for (class, selector), returning the
    /// previous resolved entry. If the method is inherited, a local
    /// override is created on `class` so siblings are unaffected.
    pub fn replace_entry_point(
        &self,
        class: ClassId,
        selector: &str,
        entry: EntryPoint,
    ) -> Result<EntryPoint, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let (encoding, previous) = match inner.resolve_method(class, selector) {
            Some((_, existing)) => (existing.encoding.clone(), Arc::clone(&existing.entry)),
            None => {
                return Err(RuntimeError::UnknownMethod {
                    class: inner.class(class)?.name.clone(),
                    selector: selector.to_string(),
                })
            }
        };
        inner.class_mut(class)?.methods.insert(
            selector.to_string(),
            MethodEntry { encoding, entry },
        );
        Ok(previous)
    }

    // ------------------------------------------------------------------
    // Dynamic subclasses and instrumentation aliases
    // ------------------------------------------------------------------

    /// The shared dynamic subclass for an origin class, creating it on
    /// first use. Used by the hook engine for per-instance dispatch.
    pub fn dynamic_subclass_for(&self, origin: ClassId) -> Result<ClassId, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.dynamic_subclasses.get(&origin) {
            return Ok(*existing);
        }
        let name = format!("graft_{}", inner.class(origin)?.name);
        let id = inner.push_class(name, Some(origin), ClassKind::DynamicSubclass { origin });
        inner.dynamic_subclasses.insert(origin, id);
        debug!(?origin, dynamic = ?id, "created dynamic subclass");
        Ok(id)
    }

    pub fn is_dynamic(&self, class: ClassId) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(
            inner.class(class).map(|c| c.kind),
            Ok(ClassKind::DynamicSubclass { .. })
        )
    }

    /// True when the class was installed by the observation mechanism.
    pub fn is_instrumented(&self, class: ClassId) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(
            inner.class(class).map(|c| c.kind),
            Ok(ClassKind::InstrumentationAlias { .. })
        )
    }

    /// Resolve a dynamic subclass or instrumentation alias back to the
    /// class it stands in for; regular classes resolve to themselves.
    pub fn origin_of(&self, class: ClassId) -> Result<ClassId, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        Ok(match inner.class(class)?.kind {
            ClassKind::Regular => class,
            ClassKind::DynamicSubclass { origin } => origin,
            ClassKind::InstrumentationAlias { origin } => origin,
        })
    }

    /// Begin property observation: installs the transparent alias subclass
    /// and redirects the object's dispatch class to it, leaving the
    /// presented class untouched.
    pub fn observe(&self, object: ObjectId) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.object(object)?.class;
        if matches!(
            inner.class(current)?.kind,
            ClassKind::InstrumentationAlias { .. }
        ) {
            return Ok(());
        }
        let alias = match inner.aliases.get(&current) {
            Some(alias) => *alias,
            None => {
                let name = format!("Observed_{}", inner.class(current)?.name);
                let id = inner.push_class(
                    name,
                    Some(current),
                    ClassKind::InstrumentationAlias { origin: current },
                );
                inner.aliases.insert(current, id);
                id
            }
        };
        inner.object_mut(object)?.class = alias;
        debug!(?object, ?alias, "installed instrumentation alias");
        Ok(())
    }

    /// End property observation: restores the dispatch class to the alias
    /// origin.
    pub fn unobserve(&self, object: ObjectId) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.object(object)?.class;
        if let ClassKind::InstrumentationAlias { origin } = inner.class(current)?.kind {
            inner.object_mut(object)?.class = origin;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub fn alloc(&self, class: ClassId) -> Result<ObjectId, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.class(class)?;
        let id = ObjectId(inner.next_object);
        inner.next_object += 1;
        inner.objects.insert(
            id,
            ObjectRecord {
                class,
                presented: class,
                ivars: HashMap::new(),
                dealloc_observers: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Deallocate. Observers run after the record is removed, outside the
    /// runtime lock, so they may call back into the runtime.
    pub fn release(&self, object: ObjectId) -> Result<(), RuntimeError> {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .objects
                .remove(&object)
                .ok_or(RuntimeError::UnknownObject(object))?
        };
        for observer in record.dealloc_observers {
            observer(self, object);
        }
        Ok(())
    }

    pub fn exists(&self, object: ObjectId) -> bool {
        self.inner.lock().unwrap().objects.contains_key(&object)
    }

    /// The class this object publicly reports; unaffected by dynamic
    /// subclassing or instrumentation.
    pub fn class_of(&self, object: ObjectId) -> Result<ClassId, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.object(object)?.presented)
    }

    /// The class dispatch actually goes through.
    pub fn actual_class_of(&self, object: ObjectId) -> Result<ClassId, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.object(object)?.class)
    }

    /// Redirect the object's dispatch class, preserving its presented
    /// identity.
    pub fn set_actual_class(&self, object: ObjectId, class: ClassId) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.class(class)?;
        inner.object_mut(object)?.class = class;
        Ok(())
    }

    pub fn add_dealloc_observer(
        &self,
        object: ObjectId,
        observer: DeallocObserver,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.object_mut(object)?.dealloc_observers.push(observer);
        Ok(())
    }

    pub fn set_ivar(&self, object: ObjectId, name: &str, value: Value) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.object_mut(object)?.ivars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn ivar(&self, object: ObjectId, name: &str) -> Result<Option<Value>, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.object(object)?.ivars.get(name).cloned())
    }

    // ------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------

    /// Intern a selector, returning its pointer-sized identity.
    pub fn selector_id(&self, name: &str) -> usize {
        self.inner.lock().unwrap().intern_selector(name)
    }

    pub fn selector_name(&self, id: usize) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.selectors.get(id.wrapping_sub(1)).cloned()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dynamic dispatch: resolve the method through the object's dispatch
    /// class, marshal `args` behind the implicit receiver and selector
    /// arguments, invoke the current entry point, and decode the return.
    pub fn send(
        &self,
        object: ObjectId,
        selector: &str,
        args: &[Value],
    ) -> Result<Value, CallError> {
        let (entry, signature, layout, sel_id) = {
            let mut inner = self.inner.lock().unwrap();
            let class = inner
                .object(object)
                .map_err(|_| CallError::ObjectNotFound(object))?
                .class;
            let (_, method) =
                inner
                    .resolve_method(class, selector)
                    .ok_or_else(|| CallError::MethodNotFound {
                        class: inner
                            .class(class)
                            .map(|c| c.name.clone())
                            .unwrap_or_default(),
                        selector: selector.to_string(),
                    })?;
            let entry = Arc::clone(&method.entry);
            let encoding = method.encoding.clone();
            let sel_id = inner.intern_selector(selector);
            // Lock is dropped before any user code runs.
            drop(inner);

            let signature = Arc::new(
                Signature::from_encoding(&encoding)
                    .map_err(|e| CallError::Failed(e.to_string()))?,
            );
            let layout = SignatureLayout::cached(&signature)
                .map_err(|e| CallError::Failed(e.to_string()))?;
            (entry, signature, layout, sel_id)
        };

        let expected = signature.arity().saturating_sub(2);
        if args.len() != expected {
            return Err(CallError::ArityMismatch {
                expected,
                got: args.len(),
            });
        }

        let mut values = Vec::with_capacity(args.len() + 2);
        values.push(object.to_ptr_value());
        values.push(Value::Ptr(sel_id));
        values.extend_from_slice(args);
        let frame = CallFrame::from_values(Arc::clone(&signature), Arc::clone(&layout), &values)?;

        let ctx = CallCtx::for_method(self);
        let ret = entry(&ctx, &frame)?;
        ret.decode(&layout)
    }
}

impl Inner {
    fn push_class(
        &mut self,
        name: String,
        superclass: Option<ClassId>,
        kind: ClassKind,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.class_by_name.insert(name.clone(), id);
        self.classes.push(ClassDef {
            name,
            superclass,
            kind,
            methods: HashMap::new(),
        });
        id
    }

    fn class(&self, id: ClassId) -> Result<&ClassDef, RuntimeError> {
        self.classes
            .get(id.0 as usize)
            .ok_or(RuntimeError::UnknownClass(id))
    }

    fn class_mut(&mut self, id: ClassId) -> Result<&mut ClassDef, RuntimeError> {
        self.classes
            .get_mut(id.0 as usize)
            .ok_or(RuntimeError::UnknownClass(id))
    }

    fn object(&self, id: ObjectId) -> Result<&ObjectRecord, RuntimeError> {
        self.objects.get(&id).ok_or(RuntimeError::UnknownObject(id))
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut ObjectRecord, RuntimeError> {
        self.objects
            .get_mut(&id)
            .ok_or(RuntimeError::UnknownObject(id))
    }

    /// Walk the superclass chain for a method.
    fn resolve_method(&self, class: ClassId, selector: &str) -> Option<(ClassId, &MethodEntry)> {
        let mut current = Some(class);
        while let Some(id) = current {
            let def = self.classes.get(id.0 as usize)?;
            if let Some(entry) = def.methods.get(selector) {
                return Some((id, entry));
            }
            current = def.superclass;
        }
        None
    }

    /// Selector ids start at 1 so no selector is the null pointer.
    fn intern_selector(&mut self, name: &str) -> usize {
        if let Some(id) = self.selector_ids.get(name) {
            return *id;
        }
        self.selectors.push(name.to_string());
        let id = self.selectors.len();
        self.selector_ids.insert(name.to_string(), id);
        id
    }
}

/// Convenience for defining method bodies as typed closures: the returned
/// value is encoded per the method's return descriptor.
pub fn method_body<F>(body: F) -> EntryPoint
where
    F: Fn(&CallCtx<'_>, &CallFrame) -> Result<Value, CallError> + Send + Sync + 'static,
{
    Arc::new(move |ctx, frame| {
        let value = body(ctx, frame)?;
        Ok(ReturnBytes::encode(&value, frame.layout())?)
    })
}
