//! In-memory host engine for tests and benchmarks
//!
//! `MockHost` models just enough of an engine to exercise the runtime: a
//! class database with tags and reference-counting flags, objects with native
//! refcounts, text resources with per-kind destructors, bound methods backed
//! by closures, and extension classes driven through their registered
//! callbacks. Every native lookup and destruction is counted so tests can
//! assert on exactly how often the runtime crossed the boundary.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::abi::{
    ClassTag, ConstTypePtr, HostVersion, InstancePtr, MethodBind, ObjectPtr, RawHandle, TypePtr,
    Word,
};
use crate::error::{AbiError, AbiResult};
use crate::host::{Destructor, ExtensionClassInfo, HostInterface};
use crate::layout::ResourceKind;

/// Body of a mock bound method
pub type MockMethodFn = Arc<dyn Fn(&mut MockCall<'_>) + Send + Sync>;

struct MockMethod {
    class: String,
    name: String,
    hash: i64,
    arity: usize,
    body: MockMethodFn,
}

struct MockClass {
    tag: Word,
    parent: Option<String>,
    refcounted: bool,
    extension: Option<ExtensionClassInfo>,
}

struct MockObject {
    class: String,
    refcount: u32,
    instance: Option<usize>,
}

struct MockResource {
    text: String,
}

/// Counters recorded by [`MockHost`]
#[derive(Debug, Default, Clone)]
pub struct MockStats {
    /// Class tag lookups per class name
    pub class_lookups: HashMap<String, usize>,
    /// Method bind lookups per (class, method)
    pub method_lookups: HashMap<(String, String), usize>,
    /// Singleton lookups per name
    pub singleton_lookups: HashMap<String, usize>,
    /// Objects constructed natively
    pub constructed: usize,
    /// Destructions per resource kind (objects under [`ResourceKind::Object`])
    pub destroyed: HashMap<ResourceKind, usize>,
    /// Destructor calls on handles that were not alive
    pub invalid_frees: usize,
    /// Messages passed to `print_error`
    pub errors: Vec<String>,
    /// Pointer calls dispatched
    pub ptrcalls: usize,
}

#[derive(Default)]
struct MockState {
    next_id: Word,
    classes: HashMap<String, MockClass>,
    methods: HashMap<Word, Arc<MockMethod>>,
    objects: HashMap<Word, MockObject>,
    resources: HashMap<Word, MockResource>,
    singletons: HashMap<String, Word>,
    missing_destructors: Vec<ResourceKind>,
    stats: MockStats,
}

impl MockState {
    fn alloc(&mut self) -> Word {
        self.next_id += 0x10;
        0x1000 + self.next_id
    }

    fn is_refcounted(&self, class: &str) -> bool {
        let mut current = self.classes.get(class);
        while let Some(entry) = current {
            if entry.refcounted {
                return true;
            }
            current = entry.parent.as_deref().and_then(|p| self.classes.get(p));
        }
        false
    }

    fn spawn_object(&mut self, class: &str) -> Word {
        let id = self.alloc();
        let refcount = if self.is_refcounted(class) { 1 } else { 0 };
        self.objects.insert(
            id,
            MockObject {
                class: class.to_string(),
                refcount,
                instance: None,
            },
        );
        self.stats.constructed += 1;
        id
    }
}

/// In-memory [`HostInterface`] implementation.
pub struct MockHost {
    version: HostVersion,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Create a host reporting version 4.3.0 with `Object`, `RefCounted`
    /// and `Node` already defined.
    pub fn new() -> Self {
        Self::with_version(HostVersion::new(4, 3, 0))
    }

    /// Create a host reporting the given version
    pub fn with_version(version: HostVersion) -> Self {
        let host = MockHost {
            version,
            state: Arc::new(Mutex::new(MockState::default())),
        };
        host.define_class("Object", None, false);
        host.define_class("RefCounted", Some("Object"), true);
        host.define_class("Node", Some("Object"), false);
        host
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Add a native class
    pub fn define_class(&self, name: &str, parent: Option<&str>, refcounted: bool) -> ClassTag {
        let mut state = self.state.lock();
        let tag = state.alloc();
        state.classes.insert(
            name.to_string(),
            MockClass {
                tag,
                parent: parent.map(str::to_string),
                refcounted,
                extension: None,
            },
        );
        ClassTag::from_word(tag).unwrap_or_else(|| unreachable!("mock ids are non-zero"))
    }

    /// Add a bound method. `arity` is the number of argument pointers the
    /// body may read.
    pub fn define_method<F>(&self, class: &str, method: &str, hash: i64, arity: usize, body: F) -> MethodBind
    where
        F: Fn(&mut MockCall<'_>) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = state.alloc();
        state.methods.insert(
            id,
            Arc::new(MockMethod {
                class: class.to_string(),
                name: method.to_string(),
                hash,
                arity,
                body: Arc::new(body),
            }),
        );
        MethodBind::from_word(id).unwrap_or_else(|| unreachable!("mock ids are non-zero"))
    }

    /// Add a singleton object of the given class
    pub fn define_singleton(&self, name: &str, class: &str) -> ObjectPtr {
        let mut state = self.state.lock();
        let id = state.spawn_object(class);
        state.singletons.insert(name.to_string(), id);
        ObjectPtr::from_word(id).unwrap_or_else(|| unreachable!("mock ids are non-zero"))
    }

    /// Make [`HostInterface::destructor`] return `None` for a kind
    pub fn remove_destructor(&self, kind: ResourceKind) {
        self.state.lock().missing_destructors.push(kind);
    }

    /// Create a native resource directly, bypassing the runtime
    pub fn new_resource(&self, text: &str) -> RawHandle {
        let mut state = self.state.lock();
        let id = state.alloc();
        state.resources.insert(
            id,
            MockResource {
                text: text.to_string(),
            },
        );
        RawHandle::from_word(id)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Snapshot of all counters
    pub fn stats(&self) -> MockStats {
        self.state.lock().stats.clone()
    }

    /// Number of method bind lookups for (class, method)
    pub fn method_lookups(&self, class: &str, method: &str) -> usize {
        let state = self.state.lock();
        let key = (class.to_string(), method.to_string());
        state.stats.method_lookups.get(&key).copied().unwrap_or(0)
    }

    /// Number of class tag lookups for a class
    pub fn class_lookups(&self, class: &str) -> usize {
        let state = self.state.lock();
        state.stats.class_lookups.get(class).copied().unwrap_or(0)
    }

    /// Number of destructions of a kind
    pub fn destroyed(&self, kind: ResourceKind) -> usize {
        let state = self.state.lock();
        state.stats.destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Messages reported through `print_error`
    pub fn errors(&self) -> Vec<String> {
        self.state.lock().stats.errors.clone()
    }

    /// Native refcount of a live object
    pub fn refcount(&self, object: ObjectPtr) -> Option<u32> {
        self.state.lock().objects.get(&object.word()).map(|o| o.refcount)
    }

    /// Whether an object is still alive
    pub fn is_alive(&self, object: ObjectPtr) -> bool {
        self.state.lock().objects.contains_key(&object.word())
    }

    /// Class name an object currently reports
    pub fn class_of(&self, object: ObjectPtr) -> Option<String> {
        self.state.lock().objects.get(&object.word()).map(|o| o.class.clone())
    }

    /// Whether a resource handle is still alive
    pub fn is_resource_alive(&self, raw: RawHandle) -> bool {
        self.state.lock().resources.contains_key(&raw.word())
    }

    /// Text of a live resource
    pub fn resource_text(&self, raw: RawHandle) -> Option<String> {
        self.state.lock().resources.get(&raw.word()).map(|r| r.text.clone())
    }

    /// Number of live resources
    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Whether an extension class is currently registered
    pub fn is_registered(&self, class: &str) -> bool {
        let state = self.state.lock();
        state.classes.get(class).is_some_and(|c| c.extension.is_some())
    }

    // ========================================================================
    // Engine Behaviour
    // ========================================================================

    /// Invoke a virtual method on an extension object the way the engine
    /// does. Returns `false` when the method is not overridden, in which
    /// case the engine would run its own default.
    ///
    /// # Safety
    /// `args` must point at values matching the virtual's signature and
    /// `ret` must be writable for its return type.
    pub unsafe fn call_virtual(&self, object: ObjectPtr, name: &str, args: &[ConstTypePtr], ret: TypePtr) -> bool {
        let Some((instance, info)) = self.extension_target(object) else {
            return false;
        };
        let Ok(cname) = CString::new(name) else {
            return false;
        };

        let data = (info.get_virtual_call_data)(info.userdata, cname.as_ptr());
        if data.is_null() {
            return false;
        }
        (info.call_virtual_with_data)(instance as InstancePtr, cname.as_ptr(), data, args.as_ptr(), ret);
        true
    }

    fn extension_target(&self, object: ObjectPtr) -> Option<(usize, ExtensionClassInfo)> {
        let state = self.state.lock();
        let obj = state.objects.get(&object.word())?;
        let instance = obj.instance?;
        let info = state.classes.get(&obj.class)?.extension?;
        Some((instance, info))
    }

    /// Send a notification to an extension object. Returns `false` for
    /// objects without a managed instance.
    pub fn notify(&self, object: ObjectPtr, what: i32, reversed: bool) -> bool {
        let Some((instance, info)) = self.extension_target(object) else {
            return false;
        };
        unsafe { (info.notification)(instance as InstancePtr, what, reversed) };
        true
    }

    /// Text form the managed instance reports, if it has one.
    ///
    /// The returned String resource is read and destroyed, as the engine
    /// would after formatting the object.
    pub fn object_to_string(&self, object: ObjectPtr) -> Option<String> {
        let (instance, info) = self.extension_target(object)?;
        let mut valid = false;
        let mut out = RawHandle::NULL;
        unsafe {
            (info.to_string)(
                instance as InstancePtr,
                &mut valid,
                &mut out as *mut RawHandle as TypePtr,
            )
        };
        if !valid {
            return None;
        }
        let mut state = self.state.lock();
        let text = state.resources.remove(&out.word()).map(|r| r.text);
        if text.is_some() {
            *state.stats.destroyed.entry(ResourceKind::String).or_default() += 1;
        }
        text
    }

    fn destroy_object(&self, id: Word) {
        let free = {
            let mut state = self.state.lock();
            match state.objects.remove(&id) {
                Some(object) => {
                    *state.stats.destroyed.entry(ResourceKind::Object).or_default() += 1;
                    let info = state.classes.get(&object.class).and_then(|c| c.extension);
                    object.instance.zip(info)
                }
                None => {
                    state.stats.invalid_frees += 1;
                    None
                }
            }
        };
        if let Some((instance, info)) = free {
            unsafe { (info.free_instance)(info.userdata, instance as InstancePtr) };
        }
    }
}

impl HostInterface for MockHost {
    fn version(&self) -> HostVersion {
        self.version
    }

    fn print_error(&self, message: &str, function: &str, file: &str, line: u32) {
        let mut state = self.state.lock();
        state
            .stats
            .errors
            .push(format!("{} ({}:{}): {}", function, file, line, message));
    }

    fn destructor(&self, kind: ResourceKind) -> Option<Destructor> {
        if kind == ResourceKind::Object || self.state.lock().missing_destructors.contains(&kind) {
            return None;
        }
        let state = Arc::clone(&self.state);
        Some(Arc::new(move |raw: RawHandle| {
            if raw.is_null() {
                return;
            }
            let mut state = state.lock();
            if state.resources.remove(&raw.word()).is_some() {
                *state.stats.destroyed.entry(kind).or_default() += 1;
            } else {
                state.stats.invalid_frees += 1;
            }
        }))
    }

    fn string_new(&self, kind: ResourceKind, text: &str) -> AbiResult<RawHandle> {
        if !kind.is_text() {
            return Err(AbiError::WrongKind {
                operation: "string_new",
                kind,
            });
        }
        Ok(self.new_resource(text))
    }

    fn string_read(&self, kind: ResourceKind, handle: RawHandle) -> AbiResult<String> {
        if !kind.is_text() {
            return Err(AbiError::WrongKind {
                operation: "string_read",
                kind,
            });
        }
        if handle.is_null() {
            return Ok(String::new());
        }
        self.resource_text(handle)
            .ok_or_else(|| AbiError::rejected("string_read", format!("{:?} is not alive", handle)))
    }

    fn resource_copy(&self, kind: ResourceKind, handle: RawHandle) -> AbiResult<RawHandle> {
        if kind == ResourceKind::Object {
            return Err(AbiError::WrongKind {
                operation: "resource_copy",
                kind,
            });
        }
        if handle.is_null() {
            return Ok(RawHandle::NULL);
        }
        let text = self
            .resource_text(handle)
            .ok_or_else(|| AbiError::rejected("resource_copy", format!("{:?} is not alive", handle)))?;
        Ok(self.new_resource(&text))
    }

    fn object_reference(&self, object: ObjectPtr) {
        let mut state = self.state.lock();
        if let Some(obj) = state.objects.get_mut(&object.word()) {
            obj.refcount += 1;
        }
    }

    fn object_unreference(&self, object: ObjectPtr) -> bool {
        let last = {
            let mut state = self.state.lock();
            match state.objects.get_mut(&object.word()) {
                Some(obj) => {
                    obj.refcount = obj.refcount.saturating_sub(1);
                    obj.refcount == 0
                }
                None => {
                    state.stats.invalid_frees += 1;
                    false
                }
            }
        };
        if last {
            self.destroy_object(object.word());
        }
        last
    }

    fn object_destroy(&self, object: ObjectPtr) {
        self.destroy_object(object.word());
    }

    fn object_set_instance(&self, object: ObjectPtr, class: &str, instance: InstancePtr) {
        let mut state = self.state.lock();
        if let Some(obj) = state.objects.get_mut(&object.word()) {
            obj.class = class.to_string();
            obj.instance = Some(instance as usize);
        }
    }

    fn global_get_singleton(&self, name: &str) -> Option<ObjectPtr> {
        let mut state = self.state.lock();
        *state.stats.singleton_lookups.entry(name.to_string()).or_default() += 1;
        state.singletons.get(name).copied().and_then(ObjectPtr::from_word)
    }

    fn classdb_get_class_tag(&self, class: &str) -> Option<ClassTag> {
        let mut state = self.state.lock();
        *state.stats.class_lookups.entry(class.to_string()).or_default() += 1;
        state.classes.get(class).and_then(|c| ClassTag::from_word(c.tag))
    }

    fn classdb_is_refcounted(&self, tag: ClassTag) -> bool {
        let state = self.state.lock();
        state
            .classes
            .iter()
            .find(|(_, c)| c.tag == tag.word())
            .is_some_and(|(name, _)| state.is_refcounted(name))
    }

    fn classdb_construct_object(&self, class: &str) -> Option<ObjectPtr> {
        let extension = {
            let mut state = self.state.lock();
            let extension = state.classes.get(class)?.extension;
            match extension {
                Some(info) => info,
                None => {
                    let id = state.spawn_object(class);
                    return ObjectPtr::from_word(id);
                }
            }
        };
        let object = unsafe { (extension.create_instance)(extension.userdata) };
        ObjectPtr::from_ptr(object)
    }

    fn classdb_get_method_bind(&self, class: &str, method: &str, hash: i64) -> Option<MethodBind> {
        let mut state = self.state.lock();
        *state
            .stats
            .method_lookups
            .entry((class.to_string(), method.to_string()))
            .or_default() += 1;
        state
            .methods
            .iter()
            .find(|(_, m)| m.class == class && m.name == method && m.hash == hash)
            .and_then(|(id, _)| MethodBind::from_word(*id))
    }

    fn classdb_register_extension_class(
        &self,
        class: &str,
        parent: &str,
        info: &ExtensionClassInfo,
    ) -> AbiResult<()> {
        let mut state = self.state.lock();
        if state.classes.contains_key(class) {
            return Err(AbiError::rejected(
                "classdb_register_extension_class",
                format!("class '{}' already exists", class),
            ));
        }
        if !state.classes.contains_key(parent) {
            return Err(AbiError::rejected(
                "classdb_register_extension_class",
                format!("parent class '{}' does not exist", parent),
            ));
        }
        let tag = state.alloc();
        state.classes.insert(
            class.to_string(),
            MockClass {
                tag,
                parent: Some(parent.to_string()),
                refcounted: false,
                extension: Some(*info),
            },
        );
        Ok(())
    }

    fn classdb_unregister_extension_class(&self, class: &str) {
        let mut state = self.state.lock();
        if state.classes.get(class).is_some_and(|c| c.extension.is_some()) {
            state.classes.remove(class);
        }
    }

    unsafe fn object_method_bind_ptrcall(
        &self,
        bind: MethodBind,
        object: Option<ObjectPtr>,
        args: *const ConstTypePtr,
        ret: TypePtr,
    ) {
        let method = {
            let mut state = self.state.lock();
            state.stats.ptrcalls += 1;
            state.methods.get(&bind.word()).cloned()
        };
        let Some(method) = method else {
            self.print_error(
                &format!("unknown method bind {:?}", bind),
                "object_method_bind_ptrcall",
                file!(),
                line!(),
            );
            return;
        };

        let args = if method.arity == 0 || args.is_null() {
            &[][..]
        } else {
            std::slice::from_raw_parts(args, method.arity)
        };
        let mut call = MockCall {
            host: self,
            object,
            args,
            ret,
        };
        (method.body)(&mut call);
    }
}

// ============================================================================
// Mock Calls
// ============================================================================

/// View of one pointer call, handed to a mock method body.
///
/// Accessors index the argument array directly and panic on an index
/// beyond the method's declared arity.
pub struct MockCall<'a> {
    host: &'a MockHost,
    object: Option<ObjectPtr>,
    args: &'a [ConstTypePtr],
    ret: TypePtr,
}

impl<'a> MockCall<'a> {
    /// The host that dispatched the call
    pub fn host(&self) -> &MockHost {
        self.host
    }

    /// Receiver object, if any
    pub fn object(&self) -> Option<ObjectPtr> {
        self.object
    }

    /// Number of argument pointers
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Read a plain value argument
    pub fn arg<T: Pod>(&self, index: usize) -> T {
        unsafe { std::ptr::read_unaligned(self.args[index] as *const T) }
    }

    /// Read the first word of a handle argument
    pub fn arg_handle(&self, index: usize) -> RawHandle {
        RawHandle::from_word(self.arg::<Word>(index))
    }

    /// Read an object argument
    pub fn arg_object(&self, index: usize) -> Option<ObjectPtr> {
        ObjectPtr::from_word(self.arg::<Word>(index))
    }

    /// Read the text of a string-like argument
    pub fn arg_text(&self, index: usize) -> Option<String> {
        self.host.resource_text(self.arg_handle(index))
    }

    /// Write a plain return value
    pub fn ret<T: Pod>(&mut self, value: T) {
        unsafe { std::ptr::write_unaligned(self.ret as *mut T, value) }
    }

    /// Write a handle return value of `words` words
    pub fn ret_handle(&mut self, raw: RawHandle, words: usize) {
        let out = self.ret as *mut Word;
        for (i, word) in raw.words().iter().take(words).enumerate() {
            unsafe { std::ptr::write_unaligned(out.add(i), *word) };
        }
    }

    /// Write an object return value; `None` writes null
    pub fn ret_object(&mut self, object: Option<ObjectPtr>) {
        self.ret(object.map_or(0, ObjectPtr::word));
    }

    /// Return a fresh native string
    pub fn ret_text(&mut self, text: &str) {
        let raw = self.host.new_resource(text);
        self.ret_handle(raw, 1);
    }

    /// Return a fresh object of `class`, as the engine would from a factory
    pub fn ret_new_object(&mut self, class: &str) -> Option<ObjectPtr> {
        let object = self.host.classdb_construct_object(class);
        self.ret_object(object);
        object
    }
}
