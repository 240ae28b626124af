//! gdbind SDK - ABI vocabulary for engine extensions
//!
//! This crate holds the types both sides of the extension boundary agree on,
//! without pulling in the runtime itself:
//!
//! - fixed-width [`Slot`]s and opaque [`RawHandle`]s
//! - the [`ResourceKind`] catalogue and its configurable [`AbiLayout`]
//! - the [`HostInterface`] trait an engine adapter implements
//! - plain-old-data geometry types passed by value
//!
//! With the `mock` feature enabled, [`mock::MockHost`] provides an in-memory
//! engine for tests.

#![warn(missing_docs)]

pub mod abi;
pub mod error;
pub mod geometry;
pub mod host;
pub mod layout;

#[cfg(feature = "mock")]
pub mod mock;

pub use abi::{
    ClassTag, ConstTypePtr, HostVersion, InstancePtr, MethodBind, ObjectPtr, RawHandle, Slot,
    TypePtr, Word, SLOT_WIDTH, SLOT_WORDS,
};
pub use error::{AbiError, AbiResult};
pub use geometry::{Color, Plane, Quaternion, Rect2, Vector2, Vector2i, Vector3, Vector3i, Vector4};
pub use host::{
    CallVirtualWithDataFn, CreateInstanceFn, Destructor, ExtensionClassInfo, FreeInstanceFn,
    GetVirtualCallDataFn, HostInterface, InitLevel, NotificationFn, ToStringFn,
};
pub use layout::{AbiLayout, KindWidth, ResourceKind};
