//! Class registry
//!
//! Lazily resolved, cached lookups into the host class database: class
//! tags, method-bind tokens and engine singletons. Each key owns a one-shot
//! cell; the map shard is locked only long enough to fetch or insert that
//! cell, and the native query runs inside the cell's initializer. Concurrent
//! requests for the same key therefore perform exactly one native
//! resolution, and requests for different keys never wait on each other's
//! native calls.
//!
//! Failed resolutions are not cached.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gdbind_sdk::{ClassTag, HostInterface, MethodBind, ObjectPtr, RawHandle};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::arena::{Arena, Handle, Ownership, OwnershipError};
use crate::dispatch::Signature;
use crate::owned::Object;

/// Identity of a native method: class, name and signature hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Declaring class
    pub class: String,
    /// Method name
    pub method: String,
    /// Engine signature hash
    pub hash: i64,
}

impl MethodKey {
    /// Build a key
    pub fn new(class: impl Into<String>, method: impl Into<String>, hash: i64) -> Self {
        MethodKey {
            class: class.into(),
            method: method.into(),
            hash,
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}#{}", self.class, self.method, self.hash)
    }
}

/// Cached facts about a native class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassEntry {
    /// Host class tag
    pub tag: ClassTag,
    /// Whether instances are reference counted
    pub refcounted: bool,
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Used before the host class database is ready
    #[error("Class database is not ready; initialize the runtime first")]
    NotReady,

    /// Class not known to the host
    #[error("Unknown class '{0}'")]
    UnknownClass(String),

    /// Method not known to the host
    #[error("Unknown method '{0}'")]
    UnknownMethod(MethodKey),

    /// Singleton not known to the host
    #[error("Unknown singleton '{0}'")]
    UnknownSingleton(String),

    /// Host returned no object
    #[error("Engine failed to construct '{0}'")]
    ConstructionFailed(String),

    /// Startup validation found unresolvable method binds
    #[error("{} of {total} declared method binds failed to resolve", .failed.len())]
    PreloadFailed {
        /// Keys that did not resolve
        failed: Vec<MethodKey>,
        /// Number of declared keys
        total: usize,
    },

    /// Constructed object could not be registered
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
}

type Cells<K, V> = DashMap<K, Arc<OnceCell<V>>>;

fn cell<K, Q, V>(map: &Cells<K, V>, key: &Q) -> Arc<OnceCell<V>>
where
    K: Borrow<Q> + Eq + Hash,
    Q: ToOwned<Owned = K> + Eq + Hash + ?Sized,
{
    if let Some(existing) = map.get(key) {
        return Arc::clone(existing.value());
    }
    Arc::clone(map.entry(key.to_owned()).or_default().value())
}

/// Host class database cache.
pub struct ClassRegistry {
    host: Arc<dyn HostInterface>,
    ready: AtomicBool,
    classes: Cells<String, ClassEntry>,
    methods: Cells<MethodKey, MethodBind>,
    singletons: Cells<String, ObjectPtr>,
    declared: Mutex<Vec<MethodKey>>,
    contracts: DashMap<String, Arc<FxHashMap<String, Signature>>>,
    native_lookups: AtomicUsize,
}

impl ClassRegistry {
    /// Create an empty registry. It is not ready until [`set_ready`] is called.
    ///
    /// [`set_ready`]: ClassRegistry::set_ready
    pub fn new(host: Arc<dyn HostInterface>) -> Self {
        ClassRegistry {
            host,
            ready: AtomicBool::new(false),
            classes: DashMap::new(),
            methods: DashMap::new(),
            singletons: DashMap::new(),
            declared: Mutex::new(Vec::new()),
            contracts: DashMap::new(),
            native_lookups: AtomicUsize::new(0),
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// Whether the host class database can be queried
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark the class database as usable (or not)
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Fail with [`RegistryError::NotReady`] before initialization
    pub fn check_ready(&self) -> Result<(), RegistryError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RegistryError::NotReady)
        }
    }

    /// Drop every cached resolution and become not ready.
    ///
    /// Declarations (method keys and virtual contracts) are kept.
    pub fn reset(&self) {
        self.set_ready(false);
        self.classes.clear();
        self.methods.clear();
        self.singletons.clear();
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve a method-bind token, once per key.
    pub fn method_bind(&self, class: &str, method: &str, hash: i64) -> Result<MethodBind, RegistryError> {
        self.resolve_method(&MethodKey::new(class, method, hash))
    }

    /// Resolve a method-bind token for a prepared key.
    pub fn resolve_method(&self, key: &MethodKey) -> Result<MethodBind, RegistryError> {
        self.check_ready()?;
        let cell = cell(&self.methods, key);
        cell.get_or_try_init(|| {
            self.native_lookups.fetch_add(1, Ordering::Relaxed);
            let bind = self
                .host
                .classdb_get_method_bind(&key.class, &key.method, key.hash);
            tracing::debug!(target: "gdbind::registry", %key, found = bind.is_some(), "resolved method bind");
            bind.ok_or_else(|| RegistryError::UnknownMethod(key.clone()))
        })
        .copied()
    }

    /// Resolve a class tag and refcount flag, once per class.
    pub fn class_entry(&self, class: &str) -> Result<ClassEntry, RegistryError> {
        self.check_ready()?;
        let cell = cell(&self.classes, class);
        cell.get_or_try_init(|| {
            self.native_lookups.fetch_add(1, Ordering::Relaxed);
            let tag = self
                .host
                .classdb_get_class_tag(class)
                .ok_or_else(|| RegistryError::UnknownClass(class.to_string()))?;
            let refcounted = self.host.classdb_is_refcounted(tag);
            tracing::debug!(target: "gdbind::registry", class, ?tag, refcounted, "resolved class");
            Ok(ClassEntry { tag, refcounted })
        })
        .copied()
    }

    /// Resolve an engine singleton, once per name.
    pub fn singleton(&self, name: &str) -> Result<ObjectPtr, RegistryError> {
        self.check_ready()?;
        let cell = cell(&self.singletons, name);
        cell.get_or_try_init(|| {
            self.native_lookups.fetch_add(1, Ordering::Relaxed);
            let object = self.host.global_get_singleton(name);
            tracing::debug!(target: "gdbind::registry", name, found = object.is_some(), "resolved singleton");
            object.ok_or_else(|| RegistryError::UnknownSingleton(name.to_string()))
        })
        .copied()
    }

    /// Construct an instance and register it in `arena`.
    ///
    /// Reference-counted classes yield a Shared handle holding the initial
    /// reference; all others an Exclusive handle destroyed on release.
    pub fn construct(&self, class: &str, arena: &Arc<Arena>) -> Result<Handle, RegistryError> {
        let entry = self.class_entry(class)?;
        let object = self
            .host
            .classdb_construct_object(class)
            .ok_or_else(|| RegistryError::ConstructionFailed(class.to_string()))?;
        let tag = if entry.refcounted {
            Ownership::Shared
        } else {
            Ownership::Exclusive
        };
        tracing::trace!(target: "gdbind::registry", class, ?object, ?tag, "constructed");
        Ok(arena.acquire::<Object>(RawHandle::from_word(object.word()), tag)?)
    }

    /// Total native queries issued so far
    pub fn native_lookups(&self) -> usize {
        self.native_lookups.load(Ordering::Relaxed)
    }

    /// Number of cached method binds
    pub fn cached_methods(&self) -> usize {
        self.methods.iter().filter(|e| e.value().get().is_some()).count()
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    /// Record a method the bindings will call, for [`preload`](Self::preload).
    pub fn declare(&self, key: MethodKey) {
        let mut declared = self.declared.lock();
        if !declared.contains(&key) {
            declared.push(key);
        }
    }

    /// Declared method keys
    pub fn declared(&self) -> Vec<MethodKey> {
        self.declared.lock().clone()
    }

    /// Resolve every declared method now, reporting all failures at once.
    ///
    /// Returns the number of keys resolved.
    pub fn preload(&self) -> Result<usize, RegistryError> {
        self.check_ready()?;
        let declared = self.declared();
        let total = declared.len();

        let mut failed = Vec::new();
        for key in declared {
            match self.resolve_method(&key) {
                Ok(_) => {}
                Err(RegistryError::UnknownMethod(key)) => failed.push(key),
                Err(e) => return Err(e),
            }
        }

        if failed.is_empty() {
            tracing::debug!(target: "gdbind::registry", total, "preloaded method binds");
            Ok(total)
        } else {
            tracing::error!(target: "gdbind::registry", failed = failed.len(), total, "method bind preload failed");
            Err(RegistryError::PreloadFailed { failed, total })
        }
    }

    /// Declare the virtual methods a native class exposes to subclasses.
    ///
    /// Repeated declarations for one class merge.
    pub fn declare_virtuals<I, S>(&self, class: &str, virtuals: I)
    where
        I: IntoIterator<Item = (S, Signature)>,
        S: Into<String>,
    {
        let mut merged = self
            .contracts
            .get(class)
            .map(|c| FxHashMap::clone(c.value()))
            .unwrap_or_default();
        merged.extend(virtuals.into_iter().map(|(name, sig)| (name.into(), sig)));
        self.contracts.insert(class.to_string(), Arc::new(merged));
    }

    /// Declared virtuals of a class, if any were declared
    pub fn contract(&self, class: &str) -> Option<Arc<FxHashMap<String, Signature>>> {
        self.contracts.get(class).map(|c| Arc::clone(c.value()))
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("ready", &self.is_ready())
            .field("classes", &self.classes.len())
            .field("methods", &self.methods.len())
            .field("singletons", &self.singletons.len())
            .field("native_lookups", &self.native_lookups())
            .finish()
    }
}
