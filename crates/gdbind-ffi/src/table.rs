//! Host function table
//!
//! A C engine describes itself with a [`GdbindHostTable`]: one userdata
//! pointer plus one function pointer per host operation. [`TableHost`]
//! checks that every entry is present and adapts the table to
//! [`HostInterface`].

use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::Arc;

use gdbind_sdk::{
    AbiError, AbiResult, ClassTag, ConstTypePtr, Destructor, ExtensionClassInfo, HostInterface,
    HostVersion, InstancePtr, MethodBind, ObjectPtr, RawHandle, ResourceKind, TypePtr, Word,
    SLOT_WORDS,
};
use libc::{c_char, c_int, size_t, ssize_t};

/// Destroys the value the pointer refers to
pub type GdbindDestructorFn = unsafe extern "C" fn(value: TypePtr);

/// Engine functions, in the layout the loader passes to `gdbind_initialize`.
///
/// Every entry is required. Values of resource kinds are passed by pointer
/// to their words; objects, class tags and method binds as opaque pointers.
/// Functions returning `c_int` return 0 on success.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GdbindHostTable {
    /// Passed back as the first argument of every function
    pub userdata: *mut c_void,
    /// Running engine version
    pub version: Option<unsafe extern "C" fn(userdata: *mut c_void) -> HostVersion>,
    /// Engine error logger
    pub print_error: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            message: *const c_char,
            function: *const c_char,
            file: *const c_char,
            line: c_int,
        ),
    >,
    /// Destructor for a resource kind (by its index), or null
    pub get_destructor:
        Option<unsafe extern "C" fn(userdata: *mut c_void, kind: u32) -> Option<GdbindDestructorFn>>,
    /// Create a text value of `kind` from UTF-8 bytes into `out`
    pub string_new: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            kind: u32,
            text: *const c_char,
            len: size_t,
            out: TypePtr,
        ) -> c_int,
    >,
    /// Copy a text value's UTF-8 bytes into `buf`; returns the full length
    /// (which may exceed `capacity`) or a negative value on error
    pub string_read: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            kind: u32,
            value: ConstTypePtr,
            buf: *mut c_char,
            capacity: size_t,
        ) -> ssize_t,
    >,
    /// Copy-construct `src` into `dst`
    pub resource_copy: Option<
        unsafe extern "C" fn(userdata: *mut c_void, kind: u32, src: ConstTypePtr, dst: TypePtr) -> c_int,
    >,
    /// Add one reference
    pub object_reference: Option<unsafe extern "C" fn(userdata: *mut c_void, object: *mut c_void)>,
    /// Drop one reference; true when the object was destroyed
    pub object_unreference: Option<unsafe extern "C" fn(userdata: *mut c_void, object: *mut c_void) -> bool>,
    /// Destroy a non-refcounted object
    pub object_destroy: Option<unsafe extern "C" fn(userdata: *mut c_void, object: *mut c_void)>,
    /// Attach a managed instance to a native object
    pub object_set_instance: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            object: *mut c_void,
            class: *const c_char,
            instance: InstancePtr,
        ),
    >,
    /// Singleton by name, or null
    pub global_get_singleton:
        Option<unsafe extern "C" fn(userdata: *mut c_void, name: *const c_char) -> *mut c_void>,
    /// Class tag by name, or null
    pub classdb_get_class_tag:
        Option<unsafe extern "C" fn(userdata: *mut c_void, class: *const c_char) -> *mut c_void>,
    /// Whether instances of the tagged class are reference counted
    pub classdb_is_refcounted: Option<unsafe extern "C" fn(userdata: *mut c_void, tag: *mut c_void) -> bool>,
    /// New instance of a class, or null
    pub classdb_construct_object:
        Option<unsafe extern "C" fn(userdata: *mut c_void, class: *const c_char) -> *mut c_void>,
    /// Method bind by class, name and hash, or null
    pub classdb_get_method_bind: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            class: *const c_char,
            method: *const c_char,
            hash: i64,
        ) -> *mut c_void,
    >,
    /// Register a managed subclass
    pub classdb_register_extension_class: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            class: *const c_char,
            parent: *const c_char,
            info: *const ExtensionClassInfo,
        ) -> c_int,
    >,
    /// Unregister a managed subclass
    pub classdb_unregister_extension_class:
        Option<unsafe extern "C" fn(userdata: *mut c_void, class: *const c_char)>,
    /// Call a bound method with a pointer array
    pub object_method_bind_ptrcall: Option<
        unsafe extern "C" fn(
            userdata: *mut c_void,
            bind: *mut c_void,
            object: *mut c_void,
            args: *const ConstTypePtr,
            ret: TypePtr,
        ),
    >,
}

macro_rules! host_functions {
    ($($field:ident: $ty:ty,)*) => {
        struct Functions {
            $($field: $ty,)*
        }

        impl Functions {
            fn resolve(table: &GdbindHostTable) -> AbiResult<Self> {
                Ok(Functions {
                    $($field: table
                        .$field
                        .ok_or_else(|| AbiError::MissingFunction(stringify!($field).to_string()))?,)*
                })
            }
        }
    };
}

host_functions! {
    version: unsafe extern "C" fn(*mut c_void) -> HostVersion,
    print_error: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *const c_char, c_int),
    get_destructor: unsafe extern "C" fn(*mut c_void, u32) -> Option<GdbindDestructorFn>,
    string_new: unsafe extern "C" fn(*mut c_void, u32, *const c_char, size_t, TypePtr) -> c_int,
    string_read: unsafe extern "C" fn(*mut c_void, u32, ConstTypePtr, *mut c_char, size_t) -> ssize_t,
    resource_copy: unsafe extern "C" fn(*mut c_void, u32, ConstTypePtr, TypePtr) -> c_int,
    object_reference: unsafe extern "C" fn(*mut c_void, *mut c_void),
    object_unreference: unsafe extern "C" fn(*mut c_void, *mut c_void) -> bool,
    object_destroy: unsafe extern "C" fn(*mut c_void, *mut c_void),
    object_set_instance: unsafe extern "C" fn(*mut c_void, *mut c_void, *const c_char, InstancePtr),
    global_get_singleton: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void,
    classdb_get_class_tag: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void,
    classdb_is_refcounted: unsafe extern "C" fn(*mut c_void, *mut c_void) -> bool,
    classdb_construct_object: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void,
    classdb_get_method_bind: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, i64) -> *mut c_void,
    classdb_register_extension_class: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *const ExtensionClassInfo) -> c_int,
    classdb_unregister_extension_class: unsafe extern "C" fn(*mut c_void, *const c_char),
    object_method_bind_ptrcall: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void, *const ConstTypePtr, TypePtr),
}

/// [`HostInterface`] over a C function table.
pub struct TableHost {
    userdata: *mut c_void,
    functions: Functions,
}

// The table contract requires every function to be callable from any thread.
unsafe impl Send for TableHost {}
unsafe impl Sync for TableHost {}

fn c_string(operation: &'static str, text: &str) -> AbiResult<CString> {
    CString::new(text).map_err(|_| AbiError::InvalidString(format!("{}: {:?} contains NUL", operation, text)))
}

fn lossy_c_string(text: &str) -> CString {
    CString::new(text.replace('\0', "?")).unwrap_or_default()
}

impl TableHost {
    /// Adapt a table, failing if any function is missing.
    pub fn new(table: &GdbindHostTable) -> AbiResult<Self> {
        Ok(TableHost {
            userdata: table.userdata,
            functions: Functions::resolve(table)?,
        })
    }

    /// Look up a named entity through a `name -> pointer` function
    fn by_name(
        &self,
        operation: &'static str,
        name: &str,
        f: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void,
    ) -> *mut c_void {
        match c_string(operation, name) {
            Ok(name) => unsafe { f(self.userdata, name.as_ptr()) },
            Err(e) => {
                tracing::warn!(target: "gdbind::ffi", error = %e, "lookup skipped");
                ptr::null_mut()
            }
        }
    }
}

impl HostInterface for TableHost {
    fn version(&self) -> HostVersion {
        unsafe { (self.functions.version)(self.userdata) }
    }

    fn print_error(&self, message: &str, function: &str, file: &str, line: u32) {
        let message = lossy_c_string(message);
        let function = lossy_c_string(function);
        let file = lossy_c_string(file);
        unsafe {
            (self.functions.print_error)(
                self.userdata,
                message.as_ptr(),
                function.as_ptr(),
                file.as_ptr(),
                c_int::try_from(line).unwrap_or(c_int::MAX),
            )
        }
    }

    fn destructor(&self, kind: ResourceKind) -> Option<Destructor> {
        let f = unsafe { (self.functions.get_destructor)(self.userdata, kind as u32) }?;
        Some(Arc::new(move |raw: RawHandle| {
            let mut words = *raw.words();
            unsafe { f(words.as_mut_ptr() as TypePtr) }
        }))
    }

    fn string_new(&self, kind: ResourceKind, text: &str) -> AbiResult<RawHandle> {
        if !kind.is_text() {
            return Err(AbiError::WrongKind {
                operation: "string_new",
                kind,
            });
        }
        let mut words = [0 as Word; SLOT_WORDS];
        let status = unsafe {
            (self.functions.string_new)(
                self.userdata,
                kind as u32,
                text.as_ptr() as *const c_char,
                text.len(),
                words.as_mut_ptr() as TypePtr,
            )
        };
        if status != 0 {
            return Err(AbiError::rejected("string_new", format!("status {}", status)));
        }
        Ok(RawHandle::from_words(&words))
    }

    fn string_read(&self, kind: ResourceKind, handle: RawHandle) -> AbiResult<String> {
        if !kind.is_text() {
            return Err(AbiError::WrongKind {
                operation: "string_read",
                kind,
            });
        }
        let value = handle.words().as_ptr() as ConstTypePtr;
        let read = |buf: &mut [u8]| unsafe {
            (self.functions.string_read)(
                self.userdata,
                kind as u32,
                value,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            )
        };

        let mut buf = Vec::new();
        loop {
            let len = usize::try_from(read(buf.as_mut_slice()))
                .map_err(|_| AbiError::rejected("string_read", "host reported an error"))?;
            if len <= buf.len() {
                buf.truncate(len);
                break;
            }
            buf.resize(len, 0);
        }
        String::from_utf8(buf).map_err(|e| AbiError::InvalidString(e.to_string()))
    }

    fn resource_copy(&self, kind: ResourceKind, handle: RawHandle) -> AbiResult<RawHandle> {
        if kind == ResourceKind::Object {
            return Err(AbiError::WrongKind {
                operation: "resource_copy",
                kind,
            });
        }
        let mut words = [0 as Word; SLOT_WORDS];
        let status = unsafe {
            (self.functions.resource_copy)(
                self.userdata,
                kind as u32,
                handle.words().as_ptr() as ConstTypePtr,
                words.as_mut_ptr() as TypePtr,
            )
        };
        if status != 0 {
            return Err(AbiError::rejected("resource_copy", format!("status {}", status)));
        }
        Ok(RawHandle::from_words(&words))
    }

    fn object_reference(&self, object: ObjectPtr) {
        unsafe { (self.functions.object_reference)(self.userdata, object.as_ptr()) }
    }

    fn object_unreference(&self, object: ObjectPtr) -> bool {
        unsafe { (self.functions.object_unreference)(self.userdata, object.as_ptr()) }
    }

    fn object_destroy(&self, object: ObjectPtr) {
        unsafe { (self.functions.object_destroy)(self.userdata, object.as_ptr()) }
    }

    fn object_set_instance(&self, object: ObjectPtr, class: &str, instance: InstancePtr) {
        let class = lossy_c_string(class);
        unsafe {
            (self.functions.object_set_instance)(self.userdata, object.as_ptr(), class.as_ptr(), instance)
        }
    }

    fn global_get_singleton(&self, name: &str) -> Option<ObjectPtr> {
        ObjectPtr::from_ptr(self.by_name("global_get_singleton", name, self.functions.global_get_singleton))
    }

    fn classdb_get_class_tag(&self, class: &str) -> Option<ClassTag> {
        ClassTag::from_ptr(self.by_name("classdb_get_class_tag", class, self.functions.classdb_get_class_tag))
    }

    fn classdb_is_refcounted(&self, tag: ClassTag) -> bool {
        unsafe { (self.functions.classdb_is_refcounted)(self.userdata, tag.as_ptr()) }
    }

    fn classdb_construct_object(&self, class: &str) -> Option<ObjectPtr> {
        ObjectPtr::from_ptr(self.by_name(
            "classdb_construct_object",
            class,
            self.functions.classdb_construct_object,
        ))
    }

    fn classdb_get_method_bind(&self, class: &str, method: &str, hash: i64) -> Option<MethodBind> {
        let class = c_string("classdb_get_method_bind", class).ok()?;
        let method = c_string("classdb_get_method_bind", method).ok()?;
        let bind = unsafe {
            (self.functions.classdb_get_method_bind)(self.userdata, class.as_ptr(), method.as_ptr(), hash)
        };
        MethodBind::from_ptr(bind)
    }

    fn classdb_register_extension_class(
        &self,
        class: &str,
        parent: &str,
        info: &ExtensionClassInfo,
    ) -> AbiResult<()> {
        let class_c = c_string("classdb_register_extension_class", class)?;
        let parent_c = c_string("classdb_register_extension_class", parent)?;
        let status = unsafe {
            (self.functions.classdb_register_extension_class)(
                self.userdata,
                class_c.as_ptr(),
                parent_c.as_ptr(),
                info,
            )
        };
        if status != 0 {
            return Err(AbiError::rejected(
                "classdb_register_extension_class",
                format!("'{}' (parent '{}') refused with status {}", class, parent, status),
            ));
        }
        Ok(())
    }

    fn classdb_unregister_extension_class(&self, class: &str) {
        if let Ok(class) = c_string("classdb_unregister_extension_class", class) {
            unsafe { (self.functions.classdb_unregister_extension_class)(self.userdata, class.as_ptr()) }
        }
    }

    unsafe fn object_method_bind_ptrcall(
        &self,
        bind: MethodBind,
        object: Option<ObjectPtr>,
        args: *const ConstTypePtr,
        ret: TypePtr,
    ) {
        (self.functions.object_method_bind_ptrcall)(
            self.userdata,
            bind.as_ptr(),
            object.map_or(ptr::null_mut(), ObjectPtr::as_ptr),
            args,
            ret,
        )
    }
}
