//! gdbind core - interop runtime between managed code and the engine
//!
//! The pieces, bottom-up:
//!
//! - [`arena`]: generational handle table with ownership tags
//! - [`owned`]: `Owned` / `Shared` / `Borrowed` wrappers over arena handles
//! - [`scope`]: batched release of a unit of work's temporaries
//! - [`marshal`] and [`frame`]: fixed-width slot encoding and pointer calls
//! - [`registry`]: cached class database lookups
//! - [`dispatch`]: engine-to-managed virtual calls for managed subclasses
//! - [`runtime`]: lifecycle tying all of the above to one host
//!
//! # Example
//!
//! ```ignore
//! use gdbind_core::{CallFrame, Owned, GString, Runtime, RuntimeOptions};
//! use gdbind_sdk::InitLevel;
//!
//! let runtime = Runtime::new(host, RuntimeOptions::default())?;
//! runtime.initialize(InitLevel::Scene)?;
//!
//! let bind = runtime.method_bind("Node", "set_name", SET_NAME_HASH)?;
//! let scope = runtime.scope();
//! let mut frame = CallFrame::new(&scope);
//! frame.push("Player")?;
//! unsafe { frame.ptrcall(bind, Some(node)) };
//! ```

pub mod arena;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod marshal;
pub mod owned;
pub mod registry;
pub mod runtime;
pub mod scope;

pub use arena::{Arena, ArenaStats, Handle, Ownership, OwnershipError};
pub use dispatch::{
    CallbackError, DispatchError, ExtensionClass, ExtensionClassBuilder, Signature, VirtualEntry,
    VirtualId, VirtualTable,
};
pub use error::{BridgeError, Result};
pub use frame::{CallFrame, FRAME_CAPACITY};
pub use marshal::{FromReturn, MarshalError, Name, PushArg, SlotType, VirtualArg, VirtualArgs, VirtualRet};
pub use owned::{
    Array, Borrowed, Callable, Dictionary, GString, NodePath, Object, Owned, PackedByteArray,
    PackedColorArray, PackedFloat32Array, PackedFloat64Array, PackedInt32Array, PackedInt64Array,
    PackedStringArray, PackedVector2Array, PackedVector3Array, Resource, Shared, Signal,
    StringName, Variant,
};
pub use registry::{ClassEntry, ClassRegistry, MethodKey, RegistryError};
pub use runtime::{LifecycleError, Runtime, RuntimeOptions};
pub use scope::LifetimeScope;
