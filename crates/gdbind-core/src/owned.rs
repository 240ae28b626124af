//! Typed ownership wrappers
//!
//! These put the arena's ownership tags into the type system:
//!
//! - [`Owned<R>`] is an exclusive value released when dropped
//! - [`Shared`] is one native reference to a refcounted object
//! - [`Borrowed<'a, R>`] is an engine-owned value with no release operation
//!
//! Releasing a borrowed value, or duplicating an exclusive one, does not
//! compile at this level. The arena still checks at runtime for code that
//! goes around the wrappers.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use gdbind_sdk::{ObjectPtr, RawHandle, ResourceKind};

use crate::arena::{Arena, Handle, Ownership, OwnershipError};

/// Static resource type of a handle.
pub trait Resource: Send + Sync + 'static {
    /// Kind used for destructor dispatch and handle width
    const KIND: ResourceKind;
}

macro_rules! resources {
    ($($(#[$meta:meta])* $name:ident => $kind:ident,)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub enum $name {}

            impl Resource for $name {
                const KIND: ResourceKind = ResourceKind::$kind;
            }
        )*
    };
}

resources! {
    /// Engine string
    GString => String,
    /// Interned engine string
    StringName => StringName,
    /// Scene tree path
    NodePath => NodePath,
    Callable => Callable,
    Signal => Signal,
    Array => Array,
    Dictionary => Dictionary,
    PackedByteArray => PackedByteArray,
    PackedInt32Array => PackedInt32Array,
    PackedInt64Array => PackedInt64Array,
    PackedFloat32Array => PackedFloat32Array,
    PackedFloat64Array => PackedFloat64Array,
    PackedStringArray => PackedStringArray,
    PackedVector2Array => PackedVector2Array,
    PackedVector3Array => PackedVector3Array,
    PackedColorArray => PackedColorArray,
    /// Tagged "any value"
    Variant => Variant,
    /// Engine object that is not reference counted
    Object => Object,
}

// ============================================================================
// Owned
// ============================================================================

/// Exclusively owned native value, released on drop.
pub struct Owned<R: Resource> {
    arena: Arc<Arena>,
    handle: Handle,
    raw: RawHandle,
    settled: bool,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Resource> Owned<R> {
    pub(crate) fn from_parts(arena: Arc<Arena>, handle: Handle, raw: RawHandle) -> Self {
        Owned {
            arena,
            handle,
            raw,
            settled: false,
            _kind: PhantomData,
        }
    }

    /// Take ownership of a value the engine handed over.
    pub fn acquire(arena: &Arc<Arena>, raw: RawHandle) -> Result<Self, OwnershipError> {
        let handle = arena.acquire::<R>(raw, Ownership::Exclusive)?;
        Ok(Owned::from_parts(Arc::clone(arena), handle, raw))
    }

    /// Create a String, StringName or NodePath from text.
    pub fn from_text(arena: &Arc<Arena>, text: &str) -> crate::Result<Self> {
        let raw = arena.host().string_new(R::KIND, text)?;
        Ok(Self::acquire(arena, raw)?)
    }

    /// Read a String, StringName or NodePath back as text.
    pub fn text(&self) -> crate::Result<String> {
        Ok(self.arena.host().string_read(R::KIND, self.raw)?)
    }

    /// Arena handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Raw native value
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// View as an engine-facing borrowed value
    pub fn as_borrowed(&self) -> Borrowed<'_, R> {
        Borrowed::from_raw(self.raw)
    }

    /// Copy-construct an independent value
    pub fn native_copy(&self) -> crate::Result<Owned<R>> {
        let handle = self.arena.native_copy(self.handle)?;
        let raw = self.arena.borrow(handle)?;
        Ok(Owned::from_parts(Arc::clone(&self.arena), handle, raw))
    }

    /// Release now instead of at drop.
    pub fn release(mut self) -> Result<(), OwnershipError> {
        self.settled = true;
        self.arena.release(self.handle)
    }

    /// Hand ownership to the engine; the runtime will not release it.
    pub fn into_raw(mut self) -> RawHandle {
        self.settled = true;
        if let Err(e) = self.arena.forget(self.handle) {
            self.arena.enforce(&e);
        }
        self.raw
    }

    /// Give up the wrapper but keep the arena entry alive
    pub(crate) fn into_handle(mut self) -> Handle {
        self.settled = true;
        self.handle
    }
}

impl<R: Resource> Drop for Owned<R> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.arena.release(self.handle) {
            self.arena.enforce(&e);
        }
    }
}

impl<R: Resource> fmt::Debug for Owned<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("kind", &R::KIND)
            .field("handle", &self.handle)
            .field("raw", &self.raw)
            .finish()
    }
}

// ============================================================================
// Shared
// ============================================================================

/// One native reference to a reference-counted object.
pub struct Shared {
    arena: Arc<Arena>,
    handle: Handle,
    object: ObjectPtr,
    settled: bool,
}

impl Shared {
    pub(crate) fn from_parts(arena: Arc<Arena>, handle: Handle, object: ObjectPtr) -> Self {
        Shared {
            arena,
            handle,
            object,
            settled: false,
        }
    }

    /// Adopt one existing native reference (no refcount change).
    pub fn acquire(arena: &Arc<Arena>, object: ObjectPtr) -> Result<Self, OwnershipError> {
        let handle = arena.acquire::<Object>(RawHandle::from_word(object.word()), Ownership::Shared)?;
        Ok(Shared::from_parts(Arc::clone(arena), handle, object))
    }

    /// The object pointer
    pub fn object(&self) -> ObjectPtr {
        self.object
    }

    /// Arena handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Take another native reference.
    pub fn duplicate(&self) -> Result<Shared, OwnershipError> {
        let handle = self.arena.duplicate(self.handle)?;
        Ok(Shared::from_parts(Arc::clone(&self.arena), handle, self.object))
    }

    /// Drop this reference now instead of at drop.
    pub fn release(mut self) -> Result<(), OwnershipError> {
        self.settled = true;
        self.arena.release(self.handle)
    }

    /// Hand this reference to the engine.
    pub fn into_object(mut self) -> ObjectPtr {
        self.settled = true;
        if let Err(e) = self.arena.forget(self.handle) {
            self.arena.enforce(&e);
        }
        self.object
    }

    pub(crate) fn into_handle(mut self) -> Handle {
        self.settled = true;
        self.handle
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.arena.release(self.handle) {
            self.arena.enforce(&e);
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("handle", &self.handle)
            .field("object", &self.object)
            .finish()
    }
}

// ============================================================================
// Borrowed
// ============================================================================

/// Engine-owned value valid for `'a`. Has no release operation.
pub struct Borrowed<'a, R: Resource> {
    raw: RawHandle,
    _marker: PhantomData<(&'a (), fn() -> R)>,
}

impl<'a, R: Resource> Borrowed<'a, R> {
    /// Wrap a value the engine keeps ownership of
    pub fn from_raw(raw: RawHandle) -> Self {
        Borrowed {
            raw,
            _marker: PhantomData,
        }
    }

    /// Raw native value
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Copy into a value the runtime owns
    pub fn to_owned_copy(&self, arena: &Arc<Arena>) -> crate::Result<Owned<R>> {
        let raw = arena.host().resource_copy(R::KIND, self.raw)?;
        Ok(Owned::acquire(arena, raw)?)
    }
}

impl<R: Resource> Clone for Borrowed<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Resource> Copy for Borrowed<'_, R> {}

impl<R: Resource> fmt::Debug for Borrowed<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Borrowed<{}>({:?})", R::KIND, self.raw)
    }
}
