//! Fixed-width ABI primitives
//!
//! Everything that crosses the engine boundary is expressed in machine words.
//! A [`Slot`] is wide enough for the largest value the ABI passes by value
//! (a tagged "any value" handle of three words), so every call frame is a
//! flat array of identical slots.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroU64;

use bytemuck::{Pod, Zeroable};

/// One pointer-width machine word.
pub type Word = u64;

/// Number of words in a slot.
pub const SLOT_WORDS: usize = 3;

/// Width of one slot in bytes.
pub const SLOT_WIDTH: usize = SLOT_WORDS * std::mem::size_of::<Word>();

/// Read-only pointer into an engine-owned argument.
pub type ConstTypePtr = *const c_void;

/// Writable pointer to an engine-owned return location.
pub type TypePtr = *mut c_void;

/// Pointer to a managed extension instance, as seen by the engine.
pub type InstancePtr = *mut c_void;

// ============================================================================
// Slot
// ============================================================================

/// A fixed-width argument or return cell.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Slot {
    words: [Word; SLOT_WORDS],
}

impl Slot {
    /// An all-zero slot
    pub const ZERO: Slot = Slot {
        words: [0; SLOT_WORDS],
    };

    /// Build a slot from leading words; remaining words are zero.
    pub fn from_words(words: &[Word]) -> Self {
        let mut slot = Slot::ZERO;
        let n = words.len().min(SLOT_WORDS);
        slot.words[..n].copy_from_slice(&words[..n]);
        slot
    }

    /// All words of the slot
    #[inline]
    pub fn words(&self) -> &[Word; SLOT_WORDS] {
        &self.words
    }

    /// First word of the slot
    #[inline]
    pub fn word(&self) -> Word {
        self.words[0]
    }

    /// Raw bytes of the slot
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Write a plain-old-data value into the leading bytes.
    ///
    /// The remaining bytes are zeroed so a slot never carries stale data.
    /// Values wider than [`SLOT_WIDTH`] are rejected with `false`.
    pub fn write_pod<T: Pod>(&mut self, value: T) -> bool {
        let src = bytemuck::bytes_of(&value);
        if src.len() > SLOT_WIDTH {
            return false;
        }
        *self = Slot::ZERO;
        bytemuck::bytes_of_mut(self)[..src.len()].copy_from_slice(src);
        true
    }

    /// Read a plain-old-data value from the leading bytes.
    pub fn read_pod<T: Pod>(&self) -> Option<T> {
        let size = std::mem::size_of::<T>();
        if size > SLOT_WIDTH {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(&self.bytes()[..size]))
    }

    /// Pointer handed to the engine as an argument
    #[inline]
    pub fn as_const_ptr(&self) -> ConstTypePtr {
        self as *const Slot as ConstTypePtr
    }

    /// Pointer handed to the engine as a return location
    #[inline]
    pub fn as_mut_ptr(&mut self) -> TypePtr {
        self as *mut Slot as TypePtr
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slot[{:#x}, {:#x}, {:#x}]",
            self.words[0], self.words[1], self.words[2]
        )
    }
}

// ============================================================================
// Raw Handles
// ============================================================================

/// Opaque native value of one to three words.
///
/// The managed side never interprets the words; it only stores them and
/// hands them back to the engine. How many words are meaningful depends on
/// the resource kind and the configured [`AbiLayout`](crate::AbiLayout).
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RawHandle {
    words: [Word; SLOT_WORDS],
}

impl RawHandle {
    /// The null handle
    pub const NULL: RawHandle = RawHandle {
        words: [0; SLOT_WORDS],
    };

    /// Build a handle from leading words; remaining words are zero.
    pub fn from_words(words: &[Word]) -> Self {
        let mut raw = RawHandle::NULL;
        let n = words.len().min(SLOT_WORDS);
        raw.words[..n].copy_from_slice(&words[..n]);
        raw
    }

    /// Build a single-word handle
    pub fn from_word(word: Word) -> Self {
        RawHandle::from_words(&[word])
    }

    /// Reinterpret a slot as a handle
    pub fn from_slot(slot: &Slot) -> Self {
        RawHandle {
            words: *slot.words(),
        }
    }

    /// All words of the handle
    #[inline]
    pub fn words(&self) -> &[Word; SLOT_WORDS] {
        &self.words
    }

    /// First word of the handle
    #[inline]
    pub fn word(&self) -> Word {
        self.words[0]
    }

    /// Whether every word is zero
    pub fn is_null(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Copy the handle into a slot
    pub fn to_slot(&self) -> Slot {
        Slot::from_words(&self.words)
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x}", self.words[0])?;
        for word in &self.words[1..] {
            if *word != 0 {
                write!(f, ", {:#x}", word)?;
            }
        }
        write!(f, ")")
    }
}

// ============================================================================
// Native Identifiers
// ============================================================================

macro_rules! native_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Wrap a native word; zero means "none".
            #[inline]
            pub fn from_word(word: Word) -> Option<Self> {
                NonZeroU64::new(word).map($name)
            }

            /// Wrap a native pointer; null means "none".
            #[inline]
            pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
                Self::from_word(ptr as usize as Word)
            }

            /// The native word
            #[inline]
            pub fn word(self) -> Word {
                self.0.get()
            }

            /// The native word as a pointer
            #[inline]
            pub fn as_ptr(self) -> *mut c_void {
                self.0.get() as usize as *mut c_void
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0.get())
            }
        }
    };
}

native_id!(
    /// Non-null pointer to an engine object.
    ///
    /// `Option<ObjectPtr>` has the same representation as a nullable word,
    /// so "no object" is always explicit.
    ObjectPtr
);

native_id!(
    /// Resolved token for one (class, method, hash) triple.
    MethodBind
);

native_id!(
    /// Engine-side identifier of a class.
    ClassTag
);

// ============================================================================
// Host Version
// ============================================================================

/// Version reported by the host engine.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
}

impl HostVersion {
    /// Create a version triple
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        HostVersion {
            major,
            minor,
            patch,
        }
    }

    /// Convert to a semver version for requirement matching
    pub fn to_semver(self) -> semver::Version {
        semver::Version::new(self.major as u64, self.minor as u64, self.patch as u64)
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
