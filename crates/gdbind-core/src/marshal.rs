//! Value marshaling across the ABI
//!
//! Four traits describe how a Rust type crosses the boundary:
//!
//! - [`PushArg`]: managed argument → call-frame slot
//! - [`FromReturn`]: call-frame return slot → managed value
//! - [`VirtualArg`]: engine argument pointer → managed value (virtual calls)
//! - [`VirtualRet`]: managed value → engine return pointer (virtual calls)
//!
//! Decoding always follows the statically declared type; the native value
//! itself is never inspected to decide how to read it.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use gdbind_sdk::{
    AbiError, AbiLayout, Color, ConstTypePtr, ObjectPtr, Plane, Quaternion, RawHandle, Rect2, ResourceKind,
    Slot, TypePtr, Vector2, Vector2i, Vector3, Vector3i, Vector4, Word, SLOT_WORDS,
};

use crate::arena::{Arena, Ownership, OwnershipError};
use crate::owned::{Borrowed, GString, Owned, Resource, Shared, StringName};
use crate::scope::LifetimeScope;

/// Static description of a value in a slot, used for virtual signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// No value
    Nil,
    /// Single byte boolean
    Bool,
    /// Plain bytes of a scalar or geometry type
    Pod {
        /// Type name
        name: &'static str,
        /// Size in bytes
        size: usize,
    },
    /// Handle to a built-in resource
    Resource(ResourceKind),
    /// Object pointer
    Object,
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Nil => f.write_str("()"),
            SlotType::Bool => f.write_str("bool"),
            SlotType::Pod { name, .. } => f.write_str(name),
            SlotType::Resource(kind) => write!(f, "{}", kind),
            SlotType::Object => f.write_str("Object"),
        }
    }
}

/// Marshaling errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    /// More arguments than a frame holds
    #[error("Call frame is full ({capacity} arguments)")]
    FrameFull {
        /// Frame capacity
        capacity: usize,
    },

    /// A value does not fit in one slot
    #[error("{name} ({size} bytes) does not fit in a slot")]
    TooWide {
        /// Type name
        name: &'static str,
        /// Size in bytes
        size: usize,
    },

    /// Null object where one was required
    #[error("Expected {expected}, got a null object")]
    NullObject {
        /// Declared type
        expected: &'static str,
    },

    /// Engine passed no argument buffer
    #[error("Argument buffer is null but {arity} arguments were expected")]
    NullArguments {
        /// Expected argument count
        arity: usize,
    },

    /// Engine passed no return location
    #[error("Return pointer is null")]
    NullReturn,

    /// Arena rejected a handle
    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    /// Host failed a conversion
    #[error(transparent)]
    Abi(#[from] AbiError),
}

// ============================================================================
// Traits
// ============================================================================

/// Managed value that can be written into an argument slot.
pub trait PushArg {
    /// Declared slot type
    const SLOT_TYPE: SlotType;

    /// Write into `slot`, registering any temporaries in `scope`.
    fn write(self, scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError>;
}

/// Managed value decoded from a return slot.
pub trait FromReturn: Sized {
    /// Declared slot type
    const SLOT_TYPE: SlotType;

    /// Decode the slot written by the engine.
    fn read(slot: &Slot, scope: &LifetimeScope) -> Result<Self, MarshalError>;
}

/// Managed value decoded from an engine argument pointer.
pub trait VirtualArg: Sized {
    /// Declared slot type
    const SLOT_TYPE: SlotType;

    /// Decode one argument.
    ///
    /// # Safety
    /// `ptr` must point at a live value of the declared native type.
    unsafe fn decode(ptr: ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError>;
}

/// Managed value encoded into an engine return pointer.
pub trait VirtualRet: Sized {
    /// Declared slot type
    const SLOT_TYPE: SlotType;

    /// Write the value. Ownership of resources moves to the engine.
    ///
    /// # Safety
    /// `ret` must be writable for the declared native type.
    unsafe fn encode(self, ret: TypePtr, arena: &Arena) -> Result<(), MarshalError>;

    /// Write the zero value used when the callback failed.
    ///
    /// # Safety
    /// Same as [`VirtualRet::encode`].
    unsafe fn encode_default(ret: TypePtr, layout: &AbiLayout);
}

/// Full argument list of a virtual method.
pub trait VirtualArgs: Sized {
    /// Number of arguments
    const ARITY: usize;

    /// Slot types in declaration order
    fn slot_types() -> Vec<SlotType>;

    /// Decode every argument.
    ///
    /// # Safety
    /// `args` must point at `ARITY` argument pointers, each valid for its
    /// declared type.
    unsafe fn decode_all(args: *const ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError>;
}

// ============================================================================
// Word Helpers
// ============================================================================

fn handle_slot(arena: &Arena, kind: ResourceKind, raw: RawHandle) -> Slot {
    let width = arena.layout().words(kind).min(SLOT_WORDS);
    Slot::from_words(&raw.words()[..width])
}

fn slot_handle(arena: &Arena, kind: ResourceKind, slot: &Slot) -> RawHandle {
    let width = arena.layout().words(kind).min(SLOT_WORDS);
    RawHandle::from_words(&slot.words()[..width])
}

unsafe fn read_words(ptr: ConstTypePtr, width: usize) -> RawHandle {
    let src = ptr as *const Word;
    let mut words = [0 as Word; SLOT_WORDS];
    for (i, word) in words.iter_mut().enumerate().take(width) {
        *word = ptr::read_unaligned(src.add(i));
    }
    RawHandle::from_words(&words)
}

unsafe fn write_words(ret: TypePtr, raw: RawHandle, width: usize) {
    let dst = ret as *mut Word;
    for (i, word) in raw.words().iter().enumerate().take(width) {
        ptr::write_unaligned(dst.add(i), *word);
    }
}

fn object_slot(object: Option<ObjectPtr>) -> Slot {
    Slot::from_words(&[object.map_or(0, ObjectPtr::word)])
}

// ============================================================================
// Plain Values
// ============================================================================

macro_rules! pod_values {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl PushArg for $ty {
                const SLOT_TYPE: SlotType = SlotType::Pod {
                    name: $name,
                    size: std::mem::size_of::<$ty>(),
                };

                #[inline(always)]
                fn write(self, _scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
                    if slot.write_pod(self) {
                        Ok(())
                    } else {
                        Err(MarshalError::TooWide { name: $name, size: std::mem::size_of::<$ty>() })
                    }
                }
            }

            impl FromReturn for $ty {
                const SLOT_TYPE: SlotType = <$ty as PushArg>::SLOT_TYPE;

                #[inline(always)]
                fn read(slot: &Slot, _scope: &LifetimeScope) -> Result<Self, MarshalError> {
                    slot.read_pod::<$ty>().ok_or(MarshalError::TooWide {
                        name: $name,
                        size: std::mem::size_of::<$ty>(),
                    })
                }
            }

            impl VirtualArg for $ty {
                const SLOT_TYPE: SlotType = <$ty as PushArg>::SLOT_TYPE;

                #[inline(always)]
                unsafe fn decode(ptr: ConstTypePtr, _arena: &Arc<Arena>) -> Result<Self, MarshalError> {
                    if ptr.is_null() {
                        return Err(MarshalError::NullArguments { arity: 1 });
                    }
                    Ok(ptr::read_unaligned(ptr as *const $ty))
                }
            }

            impl VirtualRet for $ty {
                const SLOT_TYPE: SlotType = <$ty as PushArg>::SLOT_TYPE;

                #[inline(always)]
                unsafe fn encode(self, ret: TypePtr, _arena: &Arena) -> Result<(), MarshalError> {
                    if ret.is_null() {
                        return Err(MarshalError::NullReturn);
                    }
                    ptr::write_unaligned(ret as *mut $ty, self);
                    Ok(())
                }

                unsafe fn encode_default(ret: TypePtr, _layout: &AbiLayout) {
                    if !ret.is_null() {
                        ptr::write_unaligned(ret as *mut $ty, bytemuck::Zeroable::zeroed());
                    }
                }
            }
        )*
    };
}

pod_values! {
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f32 => "f32",
    f64 => "f64",
    Vector2 => "Vector2",
    Vector2i => "Vector2i",
    Vector3 => "Vector3",
    Vector3i => "Vector3i",
    Vector4 => "Vector4",
    Color => "Color",
    Rect2 => "Rect2",
    Quaternion => "Quaternion",
    Plane => "Plane",
}

impl PushArg for bool {
    const SLOT_TYPE: SlotType = SlotType::Bool;

    fn write(self, _scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        slot.write_pod(self as u8);
        Ok(())
    }
}

impl FromReturn for bool {
    const SLOT_TYPE: SlotType = SlotType::Bool;

    fn read(slot: &Slot, _scope: &LifetimeScope) -> Result<Self, MarshalError> {
        Ok(slot.bytes()[0] != 0)
    }
}

impl VirtualArg for bool {
    const SLOT_TYPE: SlotType = SlotType::Bool;

    unsafe fn decode(ptr: ConstTypePtr, _arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        if ptr.is_null() {
            return Err(MarshalError::NullArguments { arity: 1 });
        }
        Ok(ptr::read(ptr as *const u8) != 0)
    }
}

impl VirtualRet for bool {
    const SLOT_TYPE: SlotType = SlotType::Bool;

    unsafe fn encode(self, ret: TypePtr, _arena: &Arena) -> Result<(), MarshalError> {
        if ret.is_null() {
            return Err(MarshalError::NullReturn);
        }
        ptr::write(ret as *mut u8, self as u8);
        Ok(())
    }

    unsafe fn encode_default(ret: TypePtr, _layout: &AbiLayout) {
        if !ret.is_null() {
            ptr::write(ret as *mut u8, 0);
        }
    }
}

impl FromReturn for () {
    const SLOT_TYPE: SlotType = SlotType::Nil;

    fn read(_slot: &Slot, _scope: &LifetimeScope) -> Result<Self, MarshalError> {
        Ok(())
    }
}

impl VirtualRet for () {
    const SLOT_TYPE: SlotType = SlotType::Nil;

    unsafe fn encode(self, _ret: TypePtr, _arena: &Arena) -> Result<(), MarshalError> {
        Ok(())
    }

    unsafe fn encode_default(_ret: TypePtr, _layout: &AbiLayout) {}
}

// ============================================================================
// Resources
// ============================================================================

impl<R: Resource> PushArg for &Owned<R> {
    const SLOT_TYPE: SlotType = SlotType::Resource(R::KIND);

    fn write(self, scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        *slot = handle_slot(scope.arena(), R::KIND, self.raw());
        Ok(())
    }
}

impl<R: Resource> PushArg for Borrowed<'_, R> {
    const SLOT_TYPE: SlotType = SlotType::Resource(R::KIND);

    fn write(self, scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        *slot = handle_slot(scope.arena(), R::KIND, self.raw());
        Ok(())
    }
}

/// Text argument passed as a temporary StringName instead of a String.
#[derive(Debug, Clone, Copy)]
pub struct Name<'a>(pub &'a str);

fn push_text<R: Resource>(scope: &LifetimeScope, text: &str, slot: &mut Slot) -> Result<(), MarshalError> {
    let arena = scope.arena();
    let raw = arena.host().string_new(R::KIND, text)?;
    scope.acquire::<R>(raw, Ownership::Exclusive)?;
    *slot = handle_slot(arena, R::KIND, raw);
    Ok(())
}

impl PushArg for &str {
    const SLOT_TYPE: SlotType = SlotType::Resource(ResourceKind::String);

    fn write(self, scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        push_text::<GString>(scope, self, slot)
    }
}

impl PushArg for Name<'_> {
    const SLOT_TYPE: SlotType = SlotType::Resource(ResourceKind::StringName);

    fn write(self, scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        push_text::<StringName>(scope, self.0, slot)
    }
}

impl<R: Resource> FromReturn for Owned<R> {
    const SLOT_TYPE: SlotType = SlotType::Resource(R::KIND);

    fn read(slot: &Slot, scope: &LifetimeScope) -> Result<Self, MarshalError> {
        let arena = scope.arena();
        let raw = slot_handle(arena, R::KIND, slot);
        if R::KIND == ResourceKind::Object && raw.word() == 0 {
            return Err(MarshalError::NullObject {
                expected: std::any::type_name::<R>(),
            });
        }
        Ok(Owned::acquire(arena, raw)?)
    }
}

impl FromReturn for String {
    const SLOT_TYPE: SlotType = SlotType::Resource(ResourceKind::String);

    fn read(slot: &Slot, scope: &LifetimeScope) -> Result<Self, MarshalError> {
        let arena = scope.arena();
        let raw = slot_handle(arena, ResourceKind::String, slot);
        scope.acquire::<GString>(raw, Ownership::Exclusive)?;
        Ok(arena.host().string_read(ResourceKind::String, raw)?)
    }
}

impl<R: Resource> VirtualArg for Owned<R> {
    const SLOT_TYPE: SlotType = SlotType::Resource(R::KIND);

    unsafe fn decode(ptr: ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        if ptr.is_null() {
            return Err(MarshalError::NullArguments { arity: 1 });
        }
        let borrowed = read_words(ptr, arena.layout().words(R::KIND));
        let raw = arena.host().resource_copy(R::KIND, borrowed)?;
        Ok(Owned::acquire(arena, raw)?)
    }
}

// The engine keeps ownership; the view is only meaningful until the callback
// returns.
impl<R: Resource> VirtualArg for Borrowed<'_, R> {
    const SLOT_TYPE: SlotType = SlotType::Resource(R::KIND);

    unsafe fn decode(ptr: ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        if ptr.is_null() {
            return Err(MarshalError::NullArguments { arity: 1 });
        }
        Ok(Borrowed::from_raw(read_words(ptr, arena.layout().words(R::KIND))))
    }
}

impl VirtualArg for String {
    const SLOT_TYPE: SlotType = SlotType::Resource(ResourceKind::String);

    unsafe fn decode(ptr: ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        if ptr.is_null() {
            return Err(MarshalError::NullArguments { arity: 1 });
        }
        let raw = read_words(ptr, arena.layout().words(ResourceKind::String));
        Ok(arena.host().string_read(ResourceKind::String, raw)?)
    }
}

impl<R: Resource> VirtualRet for Owned<R> {
    const SLOT_TYPE: SlotType = SlotType::Resource(R::KIND);

    unsafe fn encode(self, ret: TypePtr, arena: &Arena) -> Result<(), MarshalError> {
        if ret.is_null() {
            return Err(MarshalError::NullReturn);
        }
        let raw = self.into_raw();
        write_words(ret, raw, arena.layout().words(R::KIND));
        Ok(())
    }

    unsafe fn encode_default(ret: TypePtr, layout: &AbiLayout) {
        if !ret.is_null() {
            write_words(ret, RawHandle::NULL, layout.words(R::KIND));
        }
    }
}

impl VirtualRet for String {
    const SLOT_TYPE: SlotType = SlotType::Resource(ResourceKind::String);

    unsafe fn encode(self, ret: TypePtr, arena: &Arena) -> Result<(), MarshalError> {
        if ret.is_null() {
            return Err(MarshalError::NullReturn);
        }
        let raw = arena.host().string_new(ResourceKind::String, &self)?;
        write_words(ret, raw, arena.layout().words(ResourceKind::String));
        Ok(())
    }

    unsafe fn encode_default(ret: TypePtr, layout: &AbiLayout) {
        if !ret.is_null() {
            write_words(ret, RawHandle::NULL, layout.words(ResourceKind::String));
        }
    }
}

// ============================================================================
// Objects
// ============================================================================

impl PushArg for ObjectPtr {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn write(self, _scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        *slot = object_slot(Some(self));
        Ok(())
    }
}

impl PushArg for Option<ObjectPtr> {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn write(self, _scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        *slot = object_slot(self);
        Ok(())
    }
}

impl PushArg for &Shared {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn write(self, _scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        *slot = object_slot(Some(self.object()));
        Ok(())
    }
}

impl PushArg for Option<&Shared> {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn write(self, _scope: &LifetimeScope, slot: &mut Slot) -> Result<(), MarshalError> {
        *slot = object_slot(self.map(Shared::object));
        Ok(())
    }
}

impl FromReturn for Option<ObjectPtr> {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn read(slot: &Slot, _scope: &LifetimeScope) -> Result<Self, MarshalError> {
        Ok(ObjectPtr::from_word(slot.word()))
    }
}

impl FromReturn for ObjectPtr {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn read(slot: &Slot, _scope: &LifetimeScope) -> Result<Self, MarshalError> {
        ObjectPtr::from_word(slot.word()).ok_or(MarshalError::NullObject { expected: "ObjectPtr" })
    }
}

impl FromReturn for Option<Shared> {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn read(slot: &Slot, scope: &LifetimeScope) -> Result<Self, MarshalError> {
        match ObjectPtr::from_word(slot.word()) {
            Some(object) => Ok(Some(Shared::acquire(scope.arena(), object)?)),
            None => Ok(None),
        }
    }
}

impl FromReturn for Shared {
    const SLOT_TYPE: SlotType = SlotType::Object;

    fn read(slot: &Slot, scope: &LifetimeScope) -> Result<Self, MarshalError> {
        <Option<Shared>>::read(slot, scope)?.ok_or(MarshalError::NullObject { expected: "Shared" })
    }
}

impl VirtualArg for Option<ObjectPtr> {
    const SLOT_TYPE: SlotType = SlotType::Object;

    unsafe fn decode(ptr: ConstTypePtr, _arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        if ptr.is_null() {
            return Err(MarshalError::NullArguments { arity: 1 });
        }
        Ok(ObjectPtr::from_word(ptr::read_unaligned(ptr as *const Word)))
    }
}

impl VirtualArg for ObjectPtr {
    const SLOT_TYPE: SlotType = SlotType::Object;

    unsafe fn decode(ptr: ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        <Option<ObjectPtr>>::decode(ptr, arena)?.ok_or(MarshalError::NullObject { expected: "ObjectPtr" })
    }
}

impl VirtualRet for Option<ObjectPtr> {
    const SLOT_TYPE: SlotType = SlotType::Object;

    unsafe fn encode(self, ret: TypePtr, _arena: &Arena) -> Result<(), MarshalError> {
        if ret.is_null() {
            return Err(MarshalError::NullReturn);
        }
        ptr::write_unaligned(ret as *mut Word, self.map_or(0, ObjectPtr::word));
        Ok(())
    }

    unsafe fn encode_default(ret: TypePtr, _layout: &AbiLayout) {
        if !ret.is_null() {
            ptr::write_unaligned(ret as *mut Word, 0);
        }
    }
}

// ============================================================================
// Argument Lists
// ============================================================================

impl VirtualArgs for () {
    const ARITY: usize = 0;

    fn slot_types() -> Vec<SlotType> {
        Vec::new()
    }

    unsafe fn decode_all(_args: *const ConstTypePtr, _arena: &Arc<Arena>) -> Result<Self, MarshalError> {
        Ok(())
    }
}

macro_rules! virtual_args {
    ($arity:literal; $($arg:ident $idx:tt),+) => {
        impl<$($arg: VirtualArg),+> VirtualArgs for ($($arg,)+) {
            const ARITY: usize = $arity;

            fn slot_types() -> Vec<SlotType> {
                vec![$($arg::SLOT_TYPE),+]
            }

            unsafe fn decode_all(args: *const ConstTypePtr, arena: &Arc<Arena>) -> Result<Self, MarshalError> {
                if args.is_null() {
                    return Err(MarshalError::NullArguments { arity: $arity });
                }
                Ok(($($arg::decode(*args.add($idx), arena)?,)+))
            }
        }
    };
}

virtual_args!(1; A 0);
virtual_args!(2; A 0, B 1);
virtual_args!(3; A 0, B 1, C 2);
virtual_args!(4; A 0, B 1, C 2, D 3);
virtual_args!(5; A 0, B 1, C 2, D 3, E 4);
virtual_args!(6; A 0, B 1, C 2, D 3, E 4, F 5);
