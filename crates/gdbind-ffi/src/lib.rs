//! C entry points for gdbind
//!
//! The engine's extension loader calls these to bring the runtime up and
//! down. The API follows these principles:
//! - ABI-stable (uses only C-compatible types)
//! - Error handling via out-parameters
//! - No panic crosses the boundary
//! - Manual memory management for returned errors

pub mod table;

use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use gdbind_core::dispatch::panic_message;
use gdbind_core::runtime::{self, LifecycleError};
use gdbind_core::{BridgeError, Runtime, RuntimeOptions};
use gdbind_sdk::{AbiError, InitLevel};
use libc::{c_char, c_int};
use parking_lot::Mutex;

pub use table::{GdbindDestructorFn, GdbindHostTable, TableHost};

// ============================================================================
// Errors
// ============================================================================

/// Error information
#[repr(C)]
pub struct GdbindError {
    message: *mut c_char,
}

/// Failures reported through the C API
#[derive(Debug, thiserror::Error)]
pub enum FfiError {
    /// A required pointer argument was null
    #[error("Invalid argument: {0} is null")]
    NullArgument(&'static str),

    /// Level outside Core..=Editor
    #[error("Invalid initialization level {0}")]
    InvalidLevel(u32),

    /// Options text was not UTF-8
    #[error("Options are not valid UTF-8")]
    InvalidUtf8,

    /// Panic caught at the boundary
    #[error("Panic: {0}")]
    Panic(String),

    /// Host table problem
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// Runtime setup problem
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Runtime operation problem
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

// ============================================================================
// Helper Functions
// ============================================================================

// Serializes initialize/deinitialize so install-then-initialize is atomic.
static ENTRY: Mutex<()> = parking_lot::const_mutex(());

/// Convert Rust string to C string (caller must free)
unsafe fn rust_to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(c_str) => c_str.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Create error from FfiError
unsafe fn create_error(error: &FfiError) -> *mut GdbindError {
    let message = rust_to_c_string(&error.to_string());
    Box::into_raw(Box::new(GdbindError { message }))
}

/// Set error out-parameter
unsafe fn set_error(error_out: *mut *mut GdbindError, error: &FfiError) {
    if !error_out.is_null() {
        *error_out = create_error(error);
    }
}

/// Run `body`, turning errors and panics into -1 plus an error out-parameter
unsafe fn guard(
    operation: &'static str,
    error_out: *mut *mut GdbindError,
    body: impl FnOnce() -> Result<(), FfiError>,
) -> c_int {
    let error = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => return 0,
        Ok(Err(e)) => e,
        Err(payload) => FfiError::Panic(panic_message(payload.as_ref())),
    };
    tracing::error!(target: "gdbind::ffi", operation, %error, "call failed");
    set_error(error_out, &error);
    -1
}

unsafe fn parse_options(options: *const c_char) -> Result<RuntimeOptions, FfiError> {
    if options.is_null() {
        return Ok(RuntimeOptions::default());
    }
    let text = CStr::from_ptr(options).to_str().map_err(|_| FfiError::InvalidUtf8)?;
    Ok(RuntimeOptions::from_toml_str(text)?)
}

// ============================================================================
// Lifecycle Functions
// ============================================================================

/// Bring the runtime up to an initialization level
///
/// The first call builds the runtime from `table` and `options` and installs
/// it process-wide; later calls only advance the level, and ignore `table`
/// and `options`.
///
/// # Arguments
/// * `table` - Host function table (required on the first call)
/// * `options` - TOML runtime options, or NULL for defaults
/// * `level` - 0 = core, 1 = servers, 2 = scene, 3 = editor
/// * `error` - Optional pointer to receive error information
///
/// # Returns
/// * 0 on success
/// * -1 on failure (check error parameter)
///
/// # Safety
/// - `table` must point to a valid table whose functions stay callable
///   until the runtime is deinitialized at level 0
/// - `options` must be NULL or a NUL-terminated string
#[no_mangle]
pub unsafe extern "C" fn gdbind_initialize(
    table: *const GdbindHostTable,
    options: *const c_char,
    level: u32,
    error: *mut *mut GdbindError,
) -> c_int {
    guard("gdbind_initialize", error, || {
        let _entry = ENTRY.lock();
        let level = InitLevel::from_raw(level).ok_or(FfiError::InvalidLevel(level))?;

        let runtime = match runtime::current() {
            Ok(runtime) => runtime,
            Err(_) => {
                let table = table.as_ref().ok_or(FfiError::NullArgument("table"))?;
                let options = parse_options(options)?;
                let host = TableHost::new(table)?;
                let runtime = Runtime::new(Arc::new(host), options)?;
                runtime::install(Arc::clone(&runtime))?;
                tracing::debug!(target: "gdbind::ffi", "runtime installed");
                runtime
            }
        };

        runtime.initialize(level)?;
        Ok(())
    })
}

/// Take the runtime down from an initialization level
///
/// Leaving level 0 (core) uninstalls the runtime. Does nothing when no
/// runtime is installed.
///
/// # Arguments
/// * `level` - Level being left
/// * `error` - Optional pointer to receive error information
///
/// # Returns
/// * 0 on success
/// * -1 on failure (check error parameter)
///
/// # Safety
/// `error` must be NULL or point to writable storage for one pointer
#[no_mangle]
pub unsafe extern "C" fn gdbind_deinitialize(level: u32, error: *mut *mut GdbindError) -> c_int {
    guard("gdbind_deinitialize", error, || {
        let _entry = ENTRY.lock();
        let level = InitLevel::from_raw(level).ok_or(FfiError::InvalidLevel(level))?;
        let Ok(runtime) = runtime::current() else {
            return Ok(());
        };

        runtime.deinitialize(level);
        if level == InitLevel::Core {
            runtime::uninstall();
            tracing::debug!(target: "gdbind::ffi", "runtime uninstalled");
        }
        Ok(())
    })
}

/// Number of handles the installed runtime still tracks, or -1 when no
/// runtime is installed
///
/// # Safety
/// Always safe to call
#[no_mangle]
pub unsafe extern "C" fn gdbind_live_handles() -> i64 {
    match runtime::current() {
        Ok(runtime) => i64::try_from(runtime.arena().live_handles()).unwrap_or(i64::MAX),
        Err(_) => -1,
    }
}

// ============================================================================
// Error Functions
// ============================================================================

/// Get error message
///
/// # Arguments
/// * `error` - Pointer to GdbindError (may be NULL)
///
/// # Returns
/// * Pointer to error message string (UTF-8, NUL-terminated)
/// * NULL if error is NULL
///
/// # Safety
/// - Returned string is valid until `gdbind_error_free()` is called
/// - Do not free the returned string directly
#[no_mangle]
pub unsafe extern "C" fn gdbind_error_message(error: *const GdbindError) -> *const c_char {
    if error.is_null() {
        return ptr::null();
    }

    (*error).message
}

/// Free an error
///
/// # Arguments
/// * `error` - Pointer to GdbindError (may be NULL)
///
/// # Safety
/// - Error pointer must be valid (created by this API)
/// - Error must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn gdbind_error_free(error: *mut GdbindError) {
    if error.is_null() {
        return;
    }

    if !(*error).message.is_null() {
        let _ = CString::from_raw((*error).message);
    }

    let _ = Box::from_raw(error);
}

/// Library version as a NUL-terminated string
///
/// # Safety
/// The returned pointer is static; do not free it
#[no_mangle]
pub unsafe extern "C" fn gdbind_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gdbind_sdk::{
        ConstTypePtr, ExtensionClassInfo, HostInterface, HostVersion, InstancePtr, ResourceKind,
        TypePtr, Word,
    };
    use std::collections::HashMap;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicU64, Ordering};

    // Tests that install the process-wide runtime must not overlap.
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    #[derive(Default)]
    struct StubEngine {
        next: AtomicU64,
        strings: Mutex<HashMap<Word, String>>,
        errors: Mutex<Vec<String>>,
        registered: Mutex<Vec<String>>,
    }

    unsafe fn engine<'a>(userdata: *mut c_void) -> &'a StubEngine {
        &*(userdata as *const StubEngine)
    }

    unsafe fn text(ptr: *const c_char) -> String {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }

    unsafe extern "C" fn stub_version(_: *mut c_void) -> HostVersion {
        HostVersion::new(4, 3, 0)
    }

    unsafe extern "C" fn stub_print_error(
        userdata: *mut c_void,
        message: *const c_char,
        function: *const c_char,
        _file: *const c_char,
        _line: c_int,
    ) {
        engine(userdata)
            .errors
            .lock()
            .push(format!("{}: {}", text(function), text(message)));
    }

    unsafe extern "C" fn stub_destroy(_value: TypePtr) {}

    unsafe extern "C" fn stub_get_destructor(_: *mut c_void, _kind: u32) -> Option<GdbindDestructorFn> {
        Some(stub_destroy)
    }

    unsafe extern "C" fn stub_string_new(
        userdata: *mut c_void,
        _kind: u32,
        bytes: *const c_char,
        len: libc::size_t,
        out: TypePtr,
    ) -> c_int {
        let engine = engine(userdata);
        let slice = std::slice::from_raw_parts(bytes as *const u8, len);
        let id = 0x100 + engine.next.fetch_add(1, Ordering::Relaxed);
        engine
            .strings
            .lock()
            .insert(id, String::from_utf8_lossy(slice).into_owned());
        *(out as *mut Word) = id;
        0
    }

    unsafe extern "C" fn stub_string_read(
        userdata: *mut c_void,
        _kind: u32,
        value: ConstTypePtr,
        buf: *mut c_char,
        capacity: libc::size_t,
    ) -> libc::ssize_t {
        let id = *(value as *const Word);
        let strings = engine(userdata).strings.lock();
        let Some(s) = strings.get(&id) else {
            return -1;
        };
        let n = s.len().min(capacity);
        ptr::copy_nonoverlapping(s.as_ptr(), buf as *mut u8, n);
        s.len() as libc::ssize_t
    }

    unsafe extern "C" fn stub_resource_copy(_: *mut c_void, _: u32, src: ConstTypePtr, dst: TypePtr) -> c_int {
        *(dst as *mut Word) = *(src as *const Word);
        0
    }

    unsafe extern "C" fn stub_object(_: *mut c_void, _: *mut c_void) {}

    unsafe extern "C" fn stub_unreference(_: *mut c_void, _: *mut c_void) -> bool {
        false
    }

    unsafe extern "C" fn stub_set_instance(_: *mut c_void, _: *mut c_void, _: *const c_char, _: InstancePtr) {}

    unsafe extern "C" fn stub_by_name(_: *mut c_void, name: *const c_char) -> *mut c_void {
        if text(name) == "Object" {
            0x4000 as *mut c_void
        } else {
            ptr::null_mut()
        }
    }

    unsafe extern "C" fn stub_is_refcounted(_: *mut c_void, _: *mut c_void) -> bool {
        false
    }

    unsafe extern "C" fn stub_method_bind(_: *mut c_void, _: *const c_char, _: *const c_char, _: i64) -> *mut c_void {
        ptr::null_mut()
    }

    unsafe extern "C" fn stub_register(
        userdata: *mut c_void,
        class: *const c_char,
        _parent: *const c_char,
        _info: *const ExtensionClassInfo,
    ) -> c_int {
        engine(userdata).registered.lock().push(text(class));
        0
    }

    unsafe extern "C" fn stub_unregister(_: *mut c_void, _: *const c_char) {}

    unsafe extern "C" fn stub_ptrcall(
        _: *mut c_void,
        _: *mut c_void,
        _: *mut c_void,
        _: *const ConstTypePtr,
        _: TypePtr,
    ) {
    }

    fn table(engine: &StubEngine) -> GdbindHostTable {
        GdbindHostTable {
            userdata: engine as *const StubEngine as *mut c_void,
            version: Some(stub_version),
            print_error: Some(stub_print_error),
            get_destructor: Some(stub_get_destructor),
            string_new: Some(stub_string_new),
            string_read: Some(stub_string_read),
            resource_copy: Some(stub_resource_copy),
            object_reference: Some(stub_object),
            object_unreference: Some(stub_unreference),
            object_destroy: Some(stub_object),
            object_set_instance: Some(stub_set_instance),
            global_get_singleton: Some(stub_by_name),
            classdb_get_class_tag: Some(stub_by_name),
            classdb_is_refcounted: Some(stub_is_refcounted),
            classdb_construct_object: Some(stub_by_name),
            classdb_get_method_bind: Some(stub_method_bind),
            classdb_register_extension_class: Some(stub_register),
            classdb_unregister_extension_class: Some(stub_unregister),
            object_method_bind_ptrcall: Some(stub_ptrcall),
        }
    }

    #[test]
    fn test_table_host_strings() {
        let engine = StubEngine::default();
        let host = TableHost::new(&table(&engine)).unwrap();
        assert_eq!(host.version(), HostVersion::new(4, 3, 0));

        let long = "a fairly long engine string ".repeat(8);
        let raw = host.string_new(ResourceKind::String, &long).unwrap();
        assert_eq!(host.string_read(ResourceKind::String, raw).unwrap(), long);

        let copy = host.resource_copy(ResourceKind::String, raw).unwrap();
        assert_eq!(host.string_read(ResourceKind::String, copy).unwrap(), long);

        assert!(matches!(
            host.string_new(ResourceKind::Array, "x"),
            Err(AbiError::WrongKind { .. })
        ));
        assert!(host.destructor(ResourceKind::Dictionary).is_some());
    }

    #[test]
    fn test_table_host_lookups() {
        let engine = StubEngine::default();
        let host = TableHost::new(&table(&engine)).unwrap();

        assert!(host.classdb_get_class_tag("Object").is_some());
        assert!(host.classdb_get_class_tag("Missing").is_none());
        assert!(host.classdb_get_class_tag("Bad\0Name").is_none());
        assert!(host.classdb_get_method_bind("Object", "free", 1).is_none());

        host.print_error("boom", "_process", file!(), line!());
        assert_eq!(*engine.errors.lock(), vec!["_process: boom".to_string()]);
    }

    #[test]
    fn test_missing_function() {
        let _serial = SERIAL.lock();
        let engine = StubEngine::default();
        let mut incomplete = table(&engine);
        incomplete.print_error = None;

        assert_eq!(
            TableHost::new(&incomplete).err(),
            Some(AbiError::MissingFunction("print_error".to_string()))
        );

        unsafe {
            let mut error: *mut GdbindError = ptr::null_mut();
            let status = gdbind_initialize(&incomplete, ptr::null(), 0, &mut error as *mut *mut GdbindError);
            assert_eq!(status, -1);
            assert!(!error.is_null());
            let message = CStr::from_ptr(gdbind_error_message(error)).to_str().unwrap();
            assert!(message.contains("print_error"));
            gdbind_error_free(error);
        }
        assert!(runtime::current().is_err());
    }

    #[test]
    fn test_initialize_lifecycle() {
        let _serial = SERIAL.lock();
        let engine = StubEngine::default();
        let table = table(&engine);
        let options = CString::new("ready_level = \"servers\"").unwrap();

        unsafe {
            let mut error: *mut GdbindError = ptr::null_mut();
            assert_eq!(gdbind_initialize(&table, options.as_ptr(), 0, &mut error), 0);
            assert!(error.is_null());
            assert!(!runtime::current().unwrap().registry().is_ready());

            assert_eq!(gdbind_initialize(ptr::null(), ptr::null(), 1, &mut error), 0);
            let runtime = runtime::current().unwrap();
            assert!(runtime.registry().is_ready());
            assert!(runtime.registry().class_entry("Object").is_ok());
            assert_eq!(gdbind_live_handles(), 0);
            drop(runtime);

            assert_eq!(gdbind_deinitialize(1, &mut error), 0);
            assert_eq!(gdbind_deinitialize(0, &mut error), 0);
            assert!(error.is_null());
        }
        assert!(runtime::current().is_err());
        assert_eq!(unsafe { gdbind_live_handles() }, -1);
    }

    #[test]
    fn test_invalid_arguments() {
        let _serial = SERIAL.lock();
        let engine = StubEngine::default();
        let table = table(&engine);

        unsafe {
            let mut error: *mut GdbindError = ptr::null_mut();
            assert_eq!(gdbind_initialize(&table, ptr::null(), 9, &mut error), -1);
            let message = CStr::from_ptr(gdbind_error_message(error)).to_str().unwrap();
            assert_eq!(message, "Invalid initialization level 9");
            gdbind_error_free(error);

            error = ptr::null_mut();
            assert_eq!(gdbind_initialize(ptr::null(), ptr::null(), 0, &mut error), -1);
            gdbind_error_free(error);

            let bad = CString::new("ready_level = 3").unwrap();
            assert_eq!(gdbind_initialize(&table, bad.as_ptr(), 0, ptr::null_mut()), -1);
        }
        assert!(runtime::current().is_err());
    }

    #[test]
    fn test_error_functions_null_safe() {
        unsafe {
            assert!(gdbind_error_message(ptr::null()).is_null());
            gdbind_error_free(ptr::null_mut());
        }
    }

    #[test]
    fn test_guard_catches_panic() {
        let mut error: *mut GdbindError = ptr::null_mut();
        let status = unsafe { guard("test", &mut error, || panic!("engine went away")) };
        assert_eq!(status, -1);
        assert!(!error.is_null());

        let message = unsafe { CStr::from_ptr(gdbind_error_message(error)) };
        assert!(message.to_str().unwrap().contains("engine went away"));
        unsafe { gdbind_error_free(error) };
    }

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(gdbind_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
        assert_eq!(unsafe { libc::strlen(gdbind_version()) }, env!("CARGO_PKG_VERSION").len());
    }
}
