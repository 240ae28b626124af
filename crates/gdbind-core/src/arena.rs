//! Handle arena
//!
//! Every non-trivial native value the runtime keeps is registered here with
//! an [`Ownership`] tag. The tag decides what `release` means:
//!
//! - `Borrowed`: the engine owns the value; releasing it is a violation
//! - `Exclusive`: released exactly once through the kind's native destructor
//! - `Shared`: a reference-counted object; releasing drops one native
//!   reference and the engine decides when the object dies
//!
//! Handles are generational, so a released handle can never alias a later
//! acquisition: double release and use-after-release are reported as
//! [`OwnershipError::Stale`].
//!
//! The bookkeeping lock is held only while entries are inspected or updated.
//! Native calls (destructors, refcount changes) always happen after it is
//! dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gdbind_sdk::{AbiError, AbiLayout, Destructor, HostInterface, ObjectPtr, RawHandle, ResourceKind};
use parking_lot::Mutex;

use crate::owned::Resource;

/// Who is responsible for releasing a native value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Owned by the engine; never released by the runtime
    Borrowed,
    /// Owned by the runtime; released exactly once
    Exclusive,
    /// Reference-counted object; each handle holds one native reference
    Shared,
}

/// Generational index of an arena entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index inside the arena
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation the handle was issued with
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Ownership violations detected by the arena and lifetime scopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    /// Attempted to release a value the engine owns
    #[error("Cannot release borrowed {kind} handle {handle:?}")]
    ReleaseBorrowed {
        /// Offending handle
        handle: Handle,
        /// Its resource kind
        kind: ResourceKind,
    },

    /// Attempted to duplicate a value that is not reference counted
    #[error("{kind} handle {handle:?} is {tag:?} and cannot be duplicated")]
    NotShareable {
        /// Offending handle
        handle: Handle,
        /// Its resource kind
        kind: ResourceKind,
        /// Its ownership tag
        tag: Ownership,
    },

    /// A handle carried an unexpected ownership tag
    #[error("Handle {handle:?} is {actual:?}, expected {expected:?}")]
    WrongOwnership {
        /// Offending handle
        handle: Handle,
        /// Required tag
        expected: Ownership,
        /// Actual tag
        actual: Ownership,
    },

    /// Double release or use after release
    #[error("Handle {0:?} is stale (already released)")]
    Stale(Handle),

    /// A handle was used as the wrong resource type
    #[error("Handle {handle:?} holds {actual}, expected {expected}")]
    KindMismatch {
        /// Offending handle
        handle: Handle,
        /// Requested kind
        expected: ResourceKind,
        /// Stored kind
        actual: ResourceKind,
    },

    /// Only objects participate in native reference counting
    #[error("Shared ownership requires an object, got {0}")]
    SharedNonObject(ResourceKind),

    /// Objects are identified by a non-null pointer
    #[error("Cannot acquire a null object")]
    NullObject,

    /// The lifetime scope was already closed
    #[error("Lifetime scope is already closed")]
    ScopeClosed,

    /// The handle is not part of this lifetime scope
    #[error("Handle {0:?} is not registered in this scope")]
    NotInScope(Handle),
}

/// Snapshot of arena activity
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Handles issued, including duplicates
    pub acquired: u64,
    /// Handles released through a native call
    pub released: u64,
    /// Shared handles duplicated
    pub duplicated: u64,
    /// Handles retired without a native call
    pub forgotten: u64,
    /// Violations reported
    pub violations: u64,
    /// Handles currently live
    pub live: usize,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    duplicated: AtomicU64,
    forgotten: AtomicU64,
    violations: AtomicU64,
}

#[derive(Clone, Copy)]
struct Live {
    raw: RawHandle,
    kind: ResourceKind,
    tag: Ownership,
}

struct Entry {
    generation: u32,
    live: Option<Live>,
}

#[derive(Default)]
struct Entries {
    slots: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

impl Entries {
    fn insert(&mut self, live: Live) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.slots[index as usize];
            entry.live = Some(live);
            return Handle {
                index,
                generation: entry.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Entry {
            generation: 0,
            live: Some(live),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    fn get(&self, handle: Handle) -> Result<Live, OwnershipError> {
        self.slots
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.live)
            .ok_or(OwnershipError::Stale(handle))
    }

    fn retire(&mut self, handle: Handle) -> Result<Live, OwnershipError> {
        let entry = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .ok_or(OwnershipError::Stale(handle))?;
        let live = entry.live.take().ok_or(OwnershipError::Stale(handle))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(live)
    }
}

/// Tagged storage for native handles.
pub struct Arena {
    host: Arc<dyn HostInterface>,
    layout: AbiLayout,
    destructors: Vec<Option<Destructor>>,
    entries: Mutex<Entries>,
    counters: Counters,
    strict: bool,
}

impl Arena {
    /// Create an arena, resolving one destructor per resource kind up front.
    ///
    /// Fails if the host is missing a destructor for any non-object kind.
    pub fn new(host: Arc<dyn HostInterface>, layout: AbiLayout) -> Result<Self, AbiError> {
        let mut destructors = Vec::with_capacity(ResourceKind::COUNT);
        for kind in ResourceKind::ALL {
            if kind == ResourceKind::Object {
                destructors.push(None);
                continue;
            }
            let destructor = host
                .destructor(kind)
                .ok_or_else(|| AbiError::MissingFunction(format!("destructor for {}", kind)))?;
            destructors.push(Some(destructor));
        }

        Ok(Arena {
            host,
            layout,
            destructors,
            entries: Mutex::new(Entries::default()),
            counters: Counters::default(),
            strict: false,
        })
    }

    /// Panic on violations detected by owning wrappers even in release builds
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The host this arena releases into
    pub fn host(&self) -> &Arc<dyn HostInterface> {
        &self.host
    }

    /// Handle widths in effect
    pub fn layout(&self) -> &AbiLayout {
        &self.layout
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    /// Register a native value of static resource type `R`.
    pub fn acquire<R: Resource>(&self, raw: RawHandle, tag: Ownership) -> Result<Handle, OwnershipError> {
        self.acquire_kind(R::KIND, raw, tag)
    }

    /// Register a native value whose kind is only known at runtime.
    pub fn acquire_kind(
        &self,
        kind: ResourceKind,
        raw: RawHandle,
        tag: Ownership,
    ) -> Result<Handle, OwnershipError> {
        if tag == Ownership::Shared && kind != ResourceKind::Object {
            return Err(self.violation(OwnershipError::SharedNonObject(kind)));
        }
        if kind == ResourceKind::Object && raw.word() == 0 {
            return Err(self.violation(OwnershipError::NullObject));
        }

        let handle = self.entries.lock().insert(Live { raw, kind, tag });
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "gdbind::arena", ?handle, %kind, ?tag, "acquire");
        Ok(handle)
    }

    /// Release a handle according to its tag.
    pub fn release(&self, handle: Handle) -> Result<(), OwnershipError> {
        let live = {
            let mut entries = self.entries.lock();
            let live = entries.get(handle).map_err(|e| self.violation(e))?;
            if live.tag == Ownership::Borrowed {
                return Err(self.violation(OwnershipError::ReleaseBorrowed {
                    handle,
                    kind: live.kind,
                }));
            }
            entries.retire(handle).map_err(|e| self.violation(e))?
        };

        self.counters.released.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "gdbind::arena", ?handle, kind = %live.kind, tag = ?live.tag, "release");
        self.dispose(live);
        Ok(())
    }

    /// Issue a second handle to a shared object, taking a native reference.
    pub fn duplicate(&self, handle: Handle) -> Result<Handle, OwnershipError> {
        let (raw, copy) = {
            let mut entries = self.entries.lock();
            let live = entries.get(handle).map_err(|e| self.violation(e))?;
            if live.tag != Ownership::Shared {
                return Err(self.violation(OwnershipError::NotShareable {
                    handle,
                    kind: live.kind,
                    tag: live.tag,
                }));
            }
            (live.raw, entries.insert(live))
        };

        if let Some(object) = ObjectPtr::from_word(raw.word()) {
            self.host.object_reference(object);
        }
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
        Ok(copy)
    }

    /// Read the raw value without changing ownership.
    pub fn borrow(&self, handle: Handle) -> Result<RawHandle, OwnershipError> {
        let entries = self.entries.lock();
        entries.get(handle).map(|l| l.raw).map_err(|e| self.violation(e))
    }

    /// Ownership tag of a live handle
    pub fn tag(&self, handle: Handle) -> Result<Ownership, OwnershipError> {
        let entries = self.entries.lock();
        entries.get(handle).map(|l| l.tag).map_err(|e| self.violation(e))
    }

    /// Resource kind of a live handle
    pub fn kind(&self, handle: Handle) -> Result<ResourceKind, OwnershipError> {
        let entries = self.entries.lock();
        entries.get(handle).map(|l| l.kind).map_err(|e| self.violation(e))
    }

    /// Retire a handle without a native call.
    ///
    /// Used for borrowed values going out of scope and for owned values whose
    /// ownership moves to the engine.
    pub fn forget(&self, handle: Handle) -> Result<RawHandle, OwnershipError> {
        let live = self.entries.lock().retire(handle).map_err(|e| self.violation(e))?;
        self.counters.forgotten.fetch_add(1, Ordering::Relaxed);
        Ok(live.raw)
    }

    /// Copy-construct a new exclusive value from any live resource handle.
    pub fn native_copy(&self, handle: Handle) -> crate::Result<Handle> {
        let live = {
            let entries = self.entries.lock();
            entries.get(handle).map_err(|e| self.violation(e))?
        };
        let raw = self.host.resource_copy(live.kind, live.raw)?;
        Ok(self.acquire_kind(live.kind, raw, Ownership::Exclusive)?)
    }

    /// Number of live handles
    pub fn live_handles(&self) -> usize {
        self.entries.lock().live
    }

    /// Activity counters
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            duplicated: self.counters.duplicated.load(Ordering::Relaxed),
            forgotten: self.counters.forgotten.load(Ordering::Relaxed),
            violations: self.counters.violations.load(Ordering::Relaxed),
            live: self.live_handles(),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn dispose(&self, live: Live) {
        match (live.tag, live.kind) {
            (Ownership::Borrowed, _) => {}
            (Ownership::Shared, _) => {
                if let Some(object) = ObjectPtr::from_word(live.raw.word()) {
                    let destroyed = self.host.object_unreference(object);
                    tracing::trace!(target: "gdbind::arena", ?object, destroyed, "unreference");
                }
            }
            (Ownership::Exclusive, ResourceKind::Object) => {
                if let Some(object) = ObjectPtr::from_word(live.raw.word()) {
                    self.host.object_destroy(object);
                }
            }
            (Ownership::Exclusive, kind) => {
                if let Some(Some(destructor)) = self.destructors.get(kind.index()) {
                    destructor(live.raw);
                }
            }
        }
    }

    fn violation(&self, error: OwnershipError) -> OwnershipError {
        self.counters.violations.fetch_add(1, Ordering::Relaxed);
        tracing::error!(target: "gdbind::arena", %error, "ownership violation");
        error
    }

    /// Escalate a violation found while dropping an owning wrapper.
    pub(crate) fn enforce(&self, error: &OwnershipError) {
        if (cfg!(debug_assertions) || self.strict) && !std::thread::panicking() {
            panic!("ownership violation: {}", error);
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("live", &self.live_handles())
            .field("strict", &self.strict)
            .finish()
    }
}
