//! The engine side of the boundary
//!
//! [`HostInterface`] is everything the runtime needs from the engine. A C
//! host supplies it as a function table (see `gdbind-ffi`); tests use the
//! in-memory `MockHost`.

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::abi::{ClassTag, ConstTypePtr, HostVersion, InstancePtr, MethodBind, ObjectPtr, RawHandle, TypePtr};
use crate::error::AbiResult;
use crate::layout::ResourceKind;

/// Native destructor for one resource kind, resolved once at startup.
pub type Destructor = Arc<dyn Fn(RawHandle) + Send + Sync>;

// ============================================================================
// Initialization Levels
// ============================================================================

/// Engine initialization stages, in startup order.
///
/// The engine walks up through the levels when the extension loads and back
/// down when it unloads.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitLevel {
    /// Core types and the class database
    Core = 0,
    /// Engine servers
    Servers = 1,
    /// Scene classes
    Scene = 2,
    /// Editor classes
    Editor = 3,
}

impl InitLevel {
    /// Convert from the C representation
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(InitLevel::Core),
            1 => Some(InitLevel::Servers),
            2 => Some(InitLevel::Scene),
            3 => Some(InitLevel::Editor),
            _ => None,
        }
    }
}

// ============================================================================
// Extension Class Callbacks
// ============================================================================

/// Creates the native object backing a new extension instance.
pub type CreateInstanceFn = unsafe extern "C" fn(userdata: *mut c_void) -> *mut c_void;

/// Destroys a managed extension instance.
pub type FreeInstanceFn = unsafe extern "C" fn(userdata: *mut c_void, instance: InstancePtr);

/// Resolves a virtual name to opaque call data; null means "not overridden".
pub type GetVirtualCallDataFn =
    unsafe extern "C" fn(userdata: *mut c_void, name: *const c_char) -> *mut c_void;

/// Invokes a virtual previously resolved by [`GetVirtualCallDataFn`].
pub type CallVirtualWithDataFn = unsafe extern "C" fn(
    instance: InstancePtr,
    name: *const c_char,
    data: *mut c_void,
    args: *const ConstTypePtr,
    ret: TypePtr,
);

/// Forwards an engine notification to a managed instance.
pub type NotificationFn = unsafe extern "C" fn(instance: InstancePtr, what: i32, reversed: bool);

/// Asks a managed instance for its text form.
///
/// Writes `false` to `is_valid` when the class has no text form, in which
/// case `out` is left untouched and the engine uses its own.
pub type ToStringFn = unsafe extern "C" fn(instance: InstancePtr, is_valid: *mut bool, out: TypePtr);

/// Callbacks the engine uses to drive a managed subclass.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExtensionClassInfo {
    /// Passed back to `create_instance` and `get_virtual_call_data`
    pub userdata: *mut c_void,
    /// See [`CreateInstanceFn`]
    pub create_instance: CreateInstanceFn,
    /// See [`FreeInstanceFn`]
    pub free_instance: FreeInstanceFn,
    /// See [`GetVirtualCallDataFn`]
    pub get_virtual_call_data: GetVirtualCallDataFn,
    /// See [`CallVirtualWithDataFn`]
    pub call_virtual_with_data: CallVirtualWithDataFn,
    /// See [`NotificationFn`]
    pub notification: NotificationFn,
    /// See [`ToStringFn`]
    pub to_string: ToStringFn,
}

// The userdata pointer is owned by the runtime and outlives registration.
unsafe impl Send for ExtensionClassInfo {}
unsafe impl Sync for ExtensionClassInfo {}

// ============================================================================
// Host Interface
// ============================================================================

/// Functions provided by the host engine.
///
/// Implementations must be callable from any thread. None of these methods
/// are invoked while the runtime holds one of its own locks.
pub trait HostInterface: Send + Sync {
    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Version of the running engine
    fn version(&self) -> HostVersion;

    /// Report an error through the engine's own logger
    fn print_error(&self, message: &str, function: &str, file: &str, line: u32);

    // ========================================================================
    // Built-in Resources
    // ========================================================================

    /// Destructor for a resource kind, or `None` if the host lacks one.
    ///
    /// Never asked for [`ResourceKind::Object`]; objects are destroyed with
    /// [`HostInterface::object_destroy`].
    fn destructor(&self, kind: ResourceKind) -> Option<Destructor>;

    /// Create a String, StringName or NodePath from UTF-8 text
    fn string_new(&self, kind: ResourceKind, text: &str) -> AbiResult<RawHandle>;

    /// Read a String, StringName or NodePath back as UTF-8
    fn string_read(&self, kind: ResourceKind, handle: RawHandle) -> AbiResult<String>;

    /// Copy-construct a new resource from an existing one
    fn resource_copy(&self, kind: ResourceKind, handle: RawHandle) -> AbiResult<RawHandle>;

    // ========================================================================
    // Objects
    // ========================================================================

    /// Increment a reference-counted object's native refcount
    fn object_reference(&self, object: ObjectPtr);

    /// Decrement a native refcount. Returns `true` if the engine destroyed
    /// the object as a result.
    fn object_unreference(&self, object: ObjectPtr) -> bool;

    /// Destroy an object that is not reference counted
    fn object_destroy(&self, object: ObjectPtr);

    /// Attach a managed extension instance to its native object
    fn object_set_instance(&self, object: ObjectPtr, class: &str, instance: InstancePtr);

    /// Look up an engine singleton by name
    fn global_get_singleton(&self, name: &str) -> Option<ObjectPtr>;

    // ========================================================================
    // Class Database
    // ========================================================================

    /// Resolve a class name to its tag
    fn classdb_get_class_tag(&self, class: &str) -> Option<ClassTag>;

    /// Whether instances of the class are reference counted
    fn classdb_is_refcounted(&self, tag: ClassTag) -> bool;

    /// Construct a new object of the named class
    fn classdb_construct_object(&self, class: &str) -> Option<ObjectPtr>;

    /// Resolve a method bind for (class, method, hash)
    fn classdb_get_method_bind(&self, class: &str, method: &str, hash: i64) -> Option<MethodBind>;

    /// Register a managed subclass of `parent`
    fn classdb_register_extension_class(
        &self,
        class: &str,
        parent: &str,
        info: &ExtensionClassInfo,
    ) -> AbiResult<()>;

    /// Remove a previously registered managed subclass
    fn classdb_unregister_extension_class(&self, class: &str);

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a bound method through the pointer-call convention.
    ///
    /// # Safety
    /// `args` must point to as many argument pointers as the method expects,
    /// each pointing at a value of the exact native type, and `ret` must be
    /// writable for the method's return type.
    unsafe fn object_method_bind_ptrcall(
        &self,
        bind: MethodBind,
        object: Option<ObjectPtr>,
        args: *const ConstTypePtr,
        ret: TypePtr,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_level_order() {
        assert!(InitLevel::Core < InitLevel::Servers);
        assert!(InitLevel::Scene < InitLevel::Editor);
        assert_eq!(InitLevel::from_raw(2), Some(InitLevel::Scene));
        assert_eq!(InitLevel::from_raw(9), None);
    }
}
