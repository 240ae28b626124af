//! Virtual dispatch for managed subclasses
//!
//! An [`ExtensionClass`] is built once per managed subclass from an
//! [`ExtensionClassBuilder`]. Its [`VirtualTable`] is immutable after that:
//! there is no way to add or remove a single override later.
//!
//! The engine never calls a managed closure directly. It resolves a virtual
//! name once through `get_virtual_call_data`, which yields a pointer to the
//! matching [`VirtualEntry`] (or null when the method is not overridden and
//! the engine should run its own default), and then invokes
//! `call_virtual_with_data` with that pointer. Each invocation decodes the
//! arguments with the entry's static signature, runs the callback, and
//! encodes the result.
//!
//! Nothing unwinds into the engine. A callback that returns an error or
//! panics is caught at the trampoline, reported through the host's
//! `print_error`, and the return location receives the return type's zero
//! value.
//!
//! Besides virtuals, a class may hook the engine's notifications and its
//! text form (`on_notification`, `to_string`). These go through the same
//! boundary.

use std::any::Any;
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Weak};

use gdbind_sdk::{AbiLayout, ConstTypePtr, ExtensionClassInfo, InstancePtr, ObjectPtr, TypePtr};
use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::marshal::{MarshalError, SlotType, VirtualArgs, VirtualRet};
use crate::runtime::Runtime;

type Instance = dyn Any + Send + Sync;

type Constructor = Box<dyn Fn() -> Box<Instance> + Send + Sync>;

type Invoker = Box<
    dyn Fn(&Instance, *const ConstTypePtr, TypePtr, &Arc<Arena>) -> Result<(), CallbackError>
        + Send
        + Sync,
>;

type NotificationHook = Box<dyn Fn(&Instance, i32, bool) -> Result<(), CallbackError> + Send + Sync>;

type ToStringHook = Box<dyn Fn(&Instance) -> Result<String, CallbackError> + Send + Sync>;

/// Non-virtual callbacks, shared by every instance of a class.
#[derive(Default)]
struct InstanceHooks {
    notification: Option<NotificationHook>,
    to_string: Option<ToStringHook>,
}

// ============================================================================
// Signatures and Errors
// ============================================================================

/// Native call signature of a virtual method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Argument slot types in order
    pub args: Vec<SlotType>,
    /// Return slot type
    pub ret: SlotType,
}

impl Signature {
    /// Build a signature from explicit slot types
    pub fn new(args: impl Into<Vec<SlotType>>, ret: SlotType) -> Self {
        Signature {
            args: args.into(),
            ret,
        }
    }

    /// Derive the signature of a callback taking `A` and returning `R`
    pub fn of<A: VirtualArgs, R: VirtualRet>() -> Self {
        Signature {
            args: A::slot_types(),
            ret: R::SLOT_TYPE,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Registration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Override of a method the parent does not declare virtual
    #[error("Class '{class}' overrides '{name}', which '{parent}' does not declare as virtual")]
    UnknownVirtual {
        /// Subclass name
        class: String,
        /// Parent class name
        parent: String,
        /// Virtual name
        name: String,
    },

    /// Override whose signature differs from the declared one
    #[error("Override '{class}::{name}' has signature {found}, expected {expected}")]
    SignatureMismatch {
        /// Subclass name
        class: String,
        /// Virtual name
        name: String,
        /// Declared signature
        expected: Signature,
        /// Callback signature
        found: Signature,
    },

    /// Same virtual overridden twice
    #[error("Class '{class}' overrides '{name}' more than once")]
    DuplicateOverride {
        /// Subclass name
        class: String,
        /// Virtual name
        name: String,
    },

    /// Builder finished without a constructor
    #[error("Class '{0}' has no constructor")]
    MissingConstructor(String),

    /// Class name already registered with this runtime
    #[error("Class '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Name that cannot cross the C boundary
    #[error("Invalid virtual name {0:?}")]
    InvalidName(String),
}

/// Failure reported by an override callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(String);

impl CallbackError {
    /// Create from a message
    pub fn new(message: impl Into<String>) -> Self {
        CallbackError(message.into())
    }

    /// The message
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<MarshalError> for CallbackError {
    fn from(e: MarshalError) -> Self {
        CallbackError(e.to_string())
    }
}

impl From<String> for CallbackError {
    fn from(s: String) -> Self {
        CallbackError(s)
    }
}

impl From<&str> for CallbackError {
    fn from(s: &str) -> Self {
        CallbackError(s.to_string())
    }
}

// ============================================================================
// Virtual Table
// ============================================================================

/// One override: name, static signature and type-erased invoker.
pub struct VirtualEntry {
    name: String,
    signature: Signature,
    invoke: Invoker,
    write_default: unsafe fn(TypePtr, &AbiLayout),
    layout: Option<AbiLayout>,
}

impl VirtualEntry {
    /// Virtual method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signature derived from the callback
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Zero the return location. Unbound entries have no layout and leave
    /// it untouched.
    unsafe fn write_default(&self, ret: TypePtr) {
        if let Some(layout) = &self.layout {
            (self.write_default)(ret, layout);
        }
    }
}

impl fmt::Debug for VirtualEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualEntry")
            .field("name", &self.name)
            .field("signature", &format_args!("{}", self.signature))
            .finish()
    }
}

/// Position of an override inside its [`VirtualTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualId(usize);

impl VirtualId {
    /// Index in registration order
    pub fn index(self) -> usize {
        self.0
    }
}

/// Immutable name → override map of one class.
#[derive(Debug, Default)]
pub struct VirtualTable {
    index: FxHashMap<String, VirtualId>,
    entries: Vec<Box<VirtualEntry>>,
}

impl VirtualTable {
    /// Resolve a virtual name; `None` means "not overridden".
    pub fn lookup(&self, name: &str) -> Option<VirtualId> {
        self.index.get(name).copied()
    }

    /// Override behind a resolved id
    pub fn entry(&self, id: VirtualId) -> Option<&VirtualEntry> {
        self.entries.get(id.0).map(|e| &**e)
    }

    /// Number of overrides
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is overridden
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All overrides in registration order
    pub fn entries(&self) -> impl Iterator<Item = &VirtualEntry> {
        self.entries.iter().map(|e| &**e)
    }
}

// ============================================================================
// Extension Classes
// ============================================================================

/// A managed subclass ready for registration.
pub struct ExtensionClass {
    name: String,
    parent: String,
    constructor: Constructor,
    table: VirtualTable,
    hooks: InstanceHooks,
}

impl ExtensionClass {
    /// Start describing a managed subclass of `parent` backed by `T`
    pub fn builder<T: Any + Send + Sync>(
        name: impl Into<String>,
        parent: impl Into<String>,
    ) -> ExtensionClassBuilder<T> {
        ExtensionClassBuilder::new(name, parent)
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Native parent class name
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Overrides
    pub fn table(&self) -> &VirtualTable {
        &self.table
    }

    /// Whether instances receive engine notifications
    pub fn handles_notifications(&self) -> bool {
        self.hooks.notification.is_some()
    }

    /// Whether instances provide their own text form
    pub fn has_text_form(&self) -> bool {
        self.hooks.to_string.is_some()
    }

    /// Check every override against the parent's declared virtuals.
    ///
    /// Parents without a declared contract accept any name.
    pub fn check_contract(
        &self,
        contract: Option<&FxHashMap<String, Signature>>,
    ) -> Result<(), DispatchError> {
        let Some(contract) = contract else {
            return Ok(());
        };
        for entry in self.table.entries() {
            match contract.get(entry.name()) {
                None => {
                    return Err(DispatchError::UnknownVirtual {
                        class: self.name.clone(),
                        parent: self.parent.clone(),
                        name: entry.name.clone(),
                    })
                }
                Some(expected) if *expected != entry.signature => {
                    return Err(DispatchError::SignatureMismatch {
                        class: self.name.clone(),
                        name: entry.name.clone(),
                        expected: expected.clone(),
                        found: entry.signature.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ExtensionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionClass")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("table", &self.table)
            .field("notification", &self.handles_notifications())
            .field("to_string", &self.has_text_form())
            .finish()
    }
}

/// Builder for [`ExtensionClass`].
///
/// Callbacks receive `&T`; per-instance state that changes across calls
/// needs interior mutability because the engine may call from any thread.
pub struct ExtensionClassBuilder<T> {
    name: String,
    parent: String,
    constructor: Option<Constructor>,
    overrides: Vec<VirtualEntry>,
    hooks: InstanceHooks,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> ExtensionClassBuilder<T> {
    /// Describe a managed subclass of `parent`
    pub fn new(name: impl Into<String>, parent: impl Into<String>) -> Self {
        ExtensionClassBuilder {
            name: name.into(),
            parent: parent.into(),
            constructor: None,
            overrides: Vec::new(),
            hooks: InstanceHooks::default(),
            _marker: PhantomData,
        }
    }

    /// Factory for new instances
    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.constructor = Some(Box::new(move || Box::new(f()) as Box<Instance>));
        self
    }

    /// Use `T::default()` as the factory
    pub fn default_constructor(self) -> Self
    where
        T: Default,
    {
        self.constructor(T::default)
    }

    /// Override a virtual with an infallible callback
    pub fn override_virtual<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: VirtualArgs + 'static,
        R: VirtualRet + 'static,
        F: Fn(&T, A) -> R + Send + Sync + 'static,
    {
        self.try_override_virtual(name, move |this: &T, args: A| {
            Ok::<R, std::convert::Infallible>(f(this, args))
        })
    }

    /// Override a virtual with a fallible callback.
    ///
    /// An `Err` is reported to the engine and the zero value is returned.
    pub fn try_override_virtual<A, R, E, F>(mut self, name: &str, f: F) -> Self
    where
        A: VirtualArgs + 'static,
        R: VirtualRet + 'static,
        E: fmt::Display + 'static,
        F: Fn(&T, A) -> Result<R, E> + Send + Sync + 'static,
    {
        let invoke: Invoker = Box::new(
            move |instance: &Instance,
                  args: *const ConstTypePtr,
                  ret: TypePtr,
                  arena: &Arc<Arena>|
                  -> Result<(), CallbackError> {
            let this = downcast::<T>(instance)?;
            let args = unsafe { A::decode_all(args, arena) }?;
            let value = f(this, args).map_err(|e| CallbackError::new(e.to_string()))?;
            unsafe { value.encode(ret, arena) }?;
            Ok(())
        },
        );

        self.overrides.push(VirtualEntry {
            name: name.to_string(),
            signature: Signature::of::<A, R>(),
            invoke,
            write_default: R::encode_default,
            layout: None,
        });
        self
    }

    /// Receive the engine's notifications as `(what, reversed)`.
    pub fn on_notification<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, i32, bool) + Send + Sync + 'static,
    {
        self.hooks.notification = Some(Box::new(
            move |instance: &Instance, what: i32, reversed: bool| -> Result<(), CallbackError> {
                f(downcast::<T>(instance)?, what, reversed);
                Ok(())
            },
        ));
        self
    }

    /// Give instances a text form the engine shows instead of its own.
    pub fn to_string<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.hooks.to_string = Some(Box::new(
            move |instance: &Instance| -> Result<String, CallbackError> {
                Ok(f(downcast::<T>(instance)?))
            },
        ));
        self
    }

    /// Freeze the class description.
    pub fn build(self) -> Result<ExtensionClass, DispatchError> {
        let constructor = self
            .constructor
            .ok_or_else(|| DispatchError::MissingConstructor(self.name.clone()))?;

        let mut table = VirtualTable::default();
        for entry in self.overrides {
            if entry.name.is_empty() || entry.name.contains('\0') {
                return Err(DispatchError::InvalidName(entry.name));
            }
            if table.index.contains_key(&entry.name) {
                return Err(DispatchError::DuplicateOverride {
                    class: self.name,
                    name: entry.name,
                });
            }
            table
                .index
                .insert(entry.name.clone(), VirtualId(table.entries.len()));
            table.entries.push(Box::new(entry));
        }

        Ok(ExtensionClass {
            name: self.name,
            parent: self.parent,
            constructor,
            table,
            hooks: self.hooks,
        })
    }
}

fn downcast<T: Any>(instance: &Instance) -> Result<&T, CallbackError> {
    instance
        .downcast_ref::<T>()
        .ok_or_else(|| CallbackError::new("instance has an unexpected type"))
}

// ============================================================================
// Trampolines
// ============================================================================

/// Registered class plus the runtime it reports to. Its address is the
/// userdata pointer the engine passes back; every live instance holds a
/// reference, so the class outlives its instances even after it is
/// unregistered.
pub(crate) struct ClassBinding {
    class: ExtensionClass,
    runtime: Weak<Runtime>,
}

impl ClassBinding {
    pub(crate) fn new(mut class: ExtensionClass, runtime: Weak<Runtime>, layout: &AbiLayout) -> Self {
        for entry in &mut class.table.entries {
            entry.layout = Some(layout.clone());
        }
        ClassBinding { class, runtime }
    }

    pub(crate) fn class(&self) -> &ExtensionClass {
        &self.class
    }

    /// Callback table pointing back at this binding
    pub(crate) fn info(self: &Arc<Self>) -> ExtensionClassInfo {
        ExtensionClassInfo {
            userdata: Arc::as_ptr(self) as *mut c_void,
            create_instance,
            free_instance,
            get_virtual_call_data,
            call_virtual_with_data,
            notification,
            to_string,
        }
    }
}

struct InstanceData {
    object: ObjectPtr,
    binding: Arc<ClassBinding>,
    value: Box<Instance>,
}

impl InstanceData {
    fn hooks(&self) -> &InstanceHooks {
        &self.binding.class.hooks
    }

    fn runtime(&self) -> Option<Arc<Runtime>> {
        self.binding.runtime.upgrade()
    }
}

/// Text of a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn report(runtime: Option<&Runtime>, site: &str, message: &str) {
    tracing::error!(target: "gdbind::dispatch", site, error = message, "callback failed at engine boundary");
    if let Some(runtime) = runtime {
        runtime.host().print_error(message, site, file!(), line!());
    }
}

fn boundary<T>(
    runtime: Option<&Runtime>,
    site: &str,
    fallback: T,
    body: impl FnOnce() -> Result<T, CallbackError>,
) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            report(runtime, site, error.message());
            fallback
        }
        Err(payload) => {
            report(runtime, site, &panic_message(payload.as_ref()));
            fallback
        }
    }
}

unsafe extern "C" fn create_instance(userdata: *mut c_void) -> *mut c_void {
    let binding = userdata as *const ClassBinding;
    if binding.is_null() {
        return ptr::null_mut();
    }
    // userdata comes from `ClassBinding::info`, always an `Arc` pointer
    Arc::increment_strong_count(binding);
    let binding = Arc::from_raw(binding);
    let runtime = binding.runtime.upgrade();

    boundary(runtime.as_deref(), "create_instance", ptr::null_mut(), || {
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| CallbackError::new("runtime is gone"))?;
        let class = &binding.class;
        let name = class.name();

        let value = (class.constructor)();
        let object = runtime
            .host()
            .classdb_construct_object(class.parent())
            .ok_or_else(|| CallbackError::new(format!("cannot construct parent '{}'", class.parent())))?;

        let instance = Box::into_raw(Box::new(InstanceData {
            object,
            binding: Arc::clone(&binding),
            value,
        }));
        runtime
            .host()
            .object_set_instance(object, name, instance as InstancePtr);
        tracing::debug!(target: "gdbind::dispatch", class = name, ?object, "instance created");
        Ok(object.as_ptr())
    })
}

unsafe extern "C" fn free_instance(_userdata: *mut c_void, instance: InstancePtr) {
    if instance.is_null() {
        return;
    }
    let instance = Box::from_raw(instance as *mut InstanceData);
    let runtime = instance.runtime();

    boundary(runtime.as_deref(), "free_instance", (), || {
        tracing::debug!(target: "gdbind::dispatch", object = ?instance.object, "instance freed");
        drop(instance);
        Ok(())
    })
}

unsafe extern "C" fn get_virtual_call_data(userdata: *mut c_void, name: *const c_char) -> *mut c_void {
    let Some(binding) = (userdata as *const ClassBinding).as_ref() else {
        return ptr::null_mut();
    };
    if name.is_null() {
        return ptr::null_mut();
    }
    let runtime = binding.runtime.upgrade();

    boundary(runtime.as_deref(), "get_virtual_call_data", ptr::null_mut(), || {
        let Ok(name) = CStr::from_ptr(name).to_str() else {
            return Ok(ptr::null_mut());
        };
        let table = binding.class.table();
        Ok(table
            .lookup(name)
            .and_then(|id| table.entry(id))
            .map_or(ptr::null_mut(), |entry| entry as *const VirtualEntry as *mut c_void))
    })
}

unsafe extern "C" fn call_virtual_with_data(
    instance: InstancePtr,
    _name: *const c_char,
    data: *mut c_void,
    args: *const ConstTypePtr,
    ret: TypePtr,
) {
    let Some(entry) = (data as *const VirtualEntry).as_ref() else {
        return;
    };
    let Some(instance) = (instance as *const InstanceData).as_ref() else {
        entry.write_default(ret);
        report(None, entry.name(), "virtual called without an instance");
        return;
    };
    let Some(runtime) = instance.runtime() else {
        entry.write_default(ret);
        report(None, entry.name(), "runtime is gone");
        return;
    };
    let arena = runtime.arena();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        (entry.invoke)(instance.value.as_ref(), args, ret, arena)
    }));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    entry.write_default(ret);
    report(Some(&runtime), entry.name(), &message);
}

unsafe extern "C" fn notification(instance: InstancePtr, what: i32, reversed: bool) {
    let Some(instance) = (instance as *const InstanceData).as_ref() else {
        return;
    };
    let Some(hook) = &instance.hooks().notification else {
        return;
    };
    let runtime = instance.runtime();

    boundary(runtime.as_deref(), "notification", (), || {
        hook(instance.value.as_ref(), what, reversed)
    })
}

unsafe extern "C" fn to_string(instance: InstancePtr, is_valid: *mut bool, out: TypePtr) {
    if is_valid.is_null() {
        return;
    }
    *is_valid = false;
    let Some(instance) = (instance as *const InstanceData).as_ref() else {
        return;
    };
    let Some(hook) = &instance.hooks().to_string else {
        return;
    };
    let runtime = instance.runtime();

    *is_valid = boundary(runtime.as_deref(), "to_string", false, || {
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| CallbackError::new("runtime is gone"))?;
        let text = hook(instance.value.as_ref())?;
        text.encode(out, runtime.arena())?;
        Ok(true)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdbind_sdk::ResourceKind;

    struct Pathing;

    fn cost_signature() -> Signature {
        Signature::of::<(i64, i64), f64>()
    }

    #[test]
    fn test_signature_of() {
        let sig = cost_signature();
        assert_eq!(sig.args.len(), 2);
        assert_eq!(sig.to_string(), "(i64, i64) -> f64");

        let sig = Signature::of::<(String,), ()>();
        assert_eq!(sig.args, vec![SlotType::Resource(ResourceKind::String)]);
        assert_eq!(sig.ret, SlotType::Nil);
    }

    #[test]
    fn test_build_table() {
        let class = ExtensionClass::builder::<Pathing>("Pathing", "AStar3D")
            .constructor(|| Pathing)
            .override_virtual("_estimate_cost", |_: &Pathing, (a, b): (i64, i64)| (a + b) as f64)
            .override_virtual("_compute_cost", |_: &Pathing, (a, b): (i64, i64)| (a * b) as f64)
            .build()
            .unwrap();

        assert_eq!(class.table().len(), 2);
        let id = class.table().lookup("_estimate_cost").unwrap();
        assert_eq!(id.index(), 0);
        assert_eq!(class.table().entry(id).unwrap().signature(), &cost_signature());
        assert!(class.table().lookup("_ready").is_none());
    }

    #[test]
    fn test_build_errors() {
        let err = ExtensionClass::builder::<Pathing>("NoCtor", "Object").build().unwrap_err();
        assert_eq!(err, DispatchError::MissingConstructor("NoCtor".into()));

        let err = ExtensionClass::builder::<Pathing>("Twice", "Object")
            .constructor(|| Pathing)
            .override_virtual("_ready", |_: &Pathing, (): ()| ())
            .override_virtual("_ready", |_: &Pathing, (): ()| ())
            .build()
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateOverride { .. }));

        let err = ExtensionClass::builder::<Pathing>("Bad", "Object")
            .constructor(|| Pathing)
            .override_virtual("_re\0ady", |_: &Pathing, (): ()| ())
            .build()
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidName(_)));
    }

    #[test]
    fn test_contract_check() {
        let class = ExtensionClass::builder::<Pathing>("Pathing", "AStar3D")
            .constructor(|| Pathing)
            .override_virtual("_estimate_cost", |_: &Pathing, (a, _b): (i64, i64)| a as f64)
            .build()
            .unwrap();

        assert!(class.check_contract(None).is_ok());

        let mut contract = FxHashMap::default();
        contract.insert("_estimate_cost".to_string(), cost_signature());
        assert!(class.check_contract(Some(&contract)).is_ok());

        contract.insert(
            "_estimate_cost".to_string(),
            Signature::of::<(i32, i32), f32>(),
        );
        assert!(matches!(
            class.check_contract(Some(&contract)),
            Err(DispatchError::SignatureMismatch { .. })
        ));

        contract.clear();
        contract.insert("_compute_cost".to_string(), cost_signature());
        assert!(matches!(
            class.check_contract(Some(&contract)),
            Err(DispatchError::UnknownVirtual { .. })
        ));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload = panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }
}
