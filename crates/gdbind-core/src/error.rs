//! Error types

use gdbind_sdk::AbiError;
use thiserror::Error;

use crate::arena::OwnershipError;
use crate::dispatch::{CallbackError, DispatchError};
use crate::marshal::MarshalError;
use crate::registry::RegistryError;
use crate::runtime::LifecycleError;

/// Any error the binding core can report
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Host-side failure
    #[error("Host error: {0}")]
    Abi(#[from] AbiError),

    /// Ownership violation
    #[error("Ownership error: {0}")]
    Ownership(#[from] OwnershipError),

    /// Frame or value conversion failure
    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// Class database failure
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Extension class registration failure
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Override callback failure
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    /// Runtime lifecycle failure
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Result type for binding-core operations
pub type Result<T> = std::result::Result<T, BridgeError>;
