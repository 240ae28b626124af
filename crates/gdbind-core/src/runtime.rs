//! Runtime lifecycle
//!
//! A [`Runtime`] ties one host to its arena, class registry and registered
//! extension classes. The engine drives it through initialization levels:
//! the class database becomes usable once `initialize` reaches the
//! configured ready level, and `deinitialize` at that level tears
//! everything down again.
//!
//! One runtime per process can be installed globally with [`install`], so
//! that trampolines and generated wrappers can reach it through
//! [`current`].

use std::any::Any;
use std::sync::Arc;

use gdbind_sdk::{AbiError, AbiLayout, HostInterface, HostVersion, InitLevel, MethodBind, ObjectPtr};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arena::{Arena, Handle};
use crate::dispatch::{ClassBinding, DispatchError, ExtensionClass, ExtensionClassBuilder, Signature};
use crate::registry::ClassRegistry;
use crate::scope::LifetimeScope;

// ============================================================================
// Options
// ============================================================================

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Handle widths and supported host versions
    pub layout: AbiLayout,
    /// Level at which the class database is ready
    pub ready_level: InitLevel,
    /// Resolve every declared method bind when the database becomes ready
    pub preload_binds: bool,
    /// Panic on ownership violations in release builds too
    pub strict_ownership: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            layout: AbiLayout::default(),
            ready_level: InitLevel::Scene,
            preload_binds: false,
            strict_ownership: false,
        }
    }
}

impl RuntimeOptions {
    /// Parse options from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, LifecycleError> {
        toml::from_str(text).map_err(|e| LifecycleError::InvalidOptions(e.to_string()))
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Host version outside the layout's supported range
    #[error("Host version {found} does not satisfy '{required}'")]
    IncompatibleHost {
        /// Reported version
        found: HostVersion,
        /// Layout requirement
        required: VersionReq,
    },

    /// Options could not be parsed
    #[error("Invalid runtime options: {0}")]
    InvalidOptions(String),

    /// Layout rejected or host is missing a required function
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// [`current`] called with nothing installed
    #[error("No runtime is installed")]
    NotInstalled,

    /// [`install`] called twice
    #[error("A runtime is already installed")]
    AlreadyInstalled,
}

// ============================================================================
// Runtime
// ============================================================================

/// Binding core for one host.
pub struct Runtime {
    host: Arc<dyn HostInterface>,
    options: RuntimeOptions,
    arena: Arc<Arena>,
    registry: ClassRegistry,
    level: Mutex<Option<InitLevel>>,
    extensions: Mutex<Vec<Arc<ClassBinding>>>,
    // Names between the duplicate check and the host registration
    pending: Mutex<FxHashSet<String>>,
}

impl Runtime {
    /// Check the host and build the runtime.
    ///
    /// Fails when the host version does not satisfy the layout, the layout
    /// is invalid, or the host lacks a destructor for some resource kind.
    pub fn new(host: Arc<dyn HostInterface>, options: RuntimeOptions) -> Result<Arc<Self>, LifecycleError> {
        options.layout.validate()?;

        let version = host.version();
        if !options.layout.supports(version) {
            return Err(LifecycleError::IncompatibleHost {
                found: version,
                required: options.layout.host_version.clone(),
            });
        }

        let arena = Arena::new(Arc::clone(&host), options.layout.clone())?
            .with_strict(options.strict_ownership);
        tracing::debug!(target: "gdbind::runtime", %version, "runtime created");

        Ok(Arc::new(Runtime {
            registry: ClassRegistry::new(Arc::clone(&host)),
            host,
            options,
            arena: Arc::new(arena),
            level: Mutex::new(None),
            extensions: Mutex::new(Vec::new()),
            pending: Mutex::new(FxHashSet::default()),
        }))
    }

    /// The host
    pub fn host(&self) -> &Arc<dyn HostInterface> {
        &self.host
    }

    /// Options the runtime was built with
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Handle arena
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Class registry
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Highest level initialized so far
    pub fn level(&self) -> Option<InitLevel> {
        *self.level.lock()
    }

    /// Open a lifetime scope over this runtime's arena
    pub fn scope(&self) -> LifetimeScope {
        LifetimeScope::new(Arc::clone(&self.arena))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Engine reached `level`.
    pub fn initialize(&self, level: InitLevel) -> crate::Result<()> {
        {
            let mut current = self.level.lock();
            *current = Some(current.map_or(level, |c| c.max(level)));
        }
        tracing::debug!(target: "gdbind::runtime", ?level, "initialize");

        if level >= self.options.ready_level && !self.registry.is_ready() {
            self.registry.set_ready(true);
            tracing::debug!(target: "gdbind::runtime", ?level, "class database ready");
            if self.options.preload_binds {
                self.registry.preload()?;
            }
        }
        Ok(())
    }

    /// Engine is leaving `level`.
    pub fn deinitialize(&self, level: InitLevel) {
        tracing::debug!(target: "gdbind::runtime", ?level, "deinitialize");
        if level <= self.options.ready_level && self.registry.is_ready() {
            self.teardown();
        }

        let mut current = self.level.lock();
        *current = (level as u32).checked_sub(1).and_then(InitLevel::from_raw);
    }

    fn teardown(&self) {
        let bindings = std::mem::take(&mut *self.extensions.lock());
        for binding in bindings.iter().rev() {
            self.host
                .classdb_unregister_extension_class(binding.class().name());
            tracing::debug!(target: "gdbind::runtime", class = binding.class().name(), "unregistered extension class");
        }
        // Live instances keep their own binding; the rest drop here.
        drop(bindings);
        self.registry.reset();

        let live = self.arena.live_handles();
        if live > 0 {
            tracing::warn!(target: "gdbind::runtime", live, "handles still alive at teardown");
        }
    }

    // ========================================================================
    // Class Database
    // ========================================================================

    /// Construct an engine object of `class`.
    pub fn construct(&self, class: &str) -> crate::Result<Handle> {
        Ok(self.registry.construct(class, &self.arena)?)
    }

    /// Resolve a method-bind token
    pub fn method_bind(&self, class: &str, method: &str, hash: i64) -> crate::Result<MethodBind> {
        Ok(self.registry.method_bind(class, method, hash)?)
    }

    /// Resolve an engine singleton
    pub fn singleton(&self, name: &str) -> crate::Result<ObjectPtr> {
        Ok(self.registry.singleton(name)?)
    }

    /// Declare the virtuals a native class lets subclasses override.
    pub fn declare_virtuals<I, S>(&self, class: &str, virtuals: I)
    where
        I: IntoIterator<Item = (S, Signature)>,
        S: Into<String>,
    {
        self.registry.declare_virtuals(class, virtuals);
    }

    /// Build and register a managed subclass.
    pub fn register_extension_class<T: Any + Send + Sync>(
        self: &Arc<Self>,
        builder: ExtensionClassBuilder<T>,
    ) -> crate::Result<()> {
        self.register_class(builder.build()?)
    }

    /// Register a managed subclass with the host.
    ///
    /// Overrides are checked against the parent's declared virtuals first.
    pub fn register_class(self: &Arc<Self>, class: ExtensionClass) -> crate::Result<()> {
        self.registry.check_ready()?;
        class.check_contract(self.registry.contract(class.parent()).as_deref())?;
        {
            let mut pending = self.pending.lock();
            if self.is_registered(class.name()) || !pending.insert(class.name().to_string()) {
                return Err(DispatchError::AlreadyRegistered(class.name().to_string()).into());
            }
        }

        let binding = Arc::new(ClassBinding::new(class, Arc::downgrade(self), self.arena.layout()));
        let class = binding.class();
        let registered = self
            .host
            .classdb_register_extension_class(class.name(), class.parent(), &binding.info());
        if let Err(e) = registered {
            self.pending.lock().remove(class.name());
            return Err(e.into());
        }
        tracing::debug!(
            target: "gdbind::runtime",
            class = class.name(),
            parent = class.parent(),
            overrides = class.table().len(),
            "registered extension class"
        );

        let name = class.name().to_string();
        self.extensions.lock().push(binding);
        self.pending.lock().remove(&name);
        Ok(())
    }

    /// Whether a managed subclass is currently registered
    pub fn is_registered(&self, class: &str) -> bool {
        self.extensions
            .lock()
            .iter()
            .any(|b| b.class().name() == class)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("version", &self.host.version())
            .field("level", &self.level())
            .field("arena", &self.arena)
            .field("registry", &self.registry)
            .finish()
    }
}

// ============================================================================
// Process-wide Runtime
// ============================================================================

static CURRENT: RwLock<Option<Arc<Runtime>>> = parking_lot::const_rwlock(None);

/// Make `runtime` the process-wide runtime
pub fn install(runtime: Arc<Runtime>) -> Result<(), LifecycleError> {
    let mut slot = CURRENT.write();
    if slot.is_some() {
        return Err(LifecycleError::AlreadyInstalled);
    }
    *slot = Some(runtime);
    Ok(())
}

/// The process-wide runtime
pub fn current() -> Result<Arc<Runtime>, LifecycleError> {
    CURRENT.read().clone().ok_or(LifecycleError::NotInstalled)
}

/// Remove and return the process-wide runtime
pub fn uninstall() -> Option<Arc<Runtime>> {
    CURRENT.write().take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdbind_sdk::mock::MockHost;
    use gdbind_sdk::ResourceKind;

    #[test]
    fn test_options_from_toml() {
        let options = RuntimeOptions::from_toml_str(
            r#"
            ready_level = "servers"
            preload_binds = true

            [layout]
            host_version = ">=4.2, <4.4"
            "#,
        )
        .unwrap();
        assert_eq!(options.ready_level, InitLevel::Servers);
        assert!(options.preload_binds);
        assert!(!options.strict_ownership);
        assert!(options.layout.supports(HostVersion::new(4, 3, 0)));
        assert!(!options.layout.supports(HostVersion::new(4, 4, 0)));

        assert_eq!(RuntimeOptions::from_toml_str("").unwrap(), RuntimeOptions::default());
        assert!(matches!(
            RuntimeOptions::from_toml_str("ready_level = 3"),
            Err(LifecycleError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_incompatible_host() {
        let host = Arc::new(MockHost::with_version(HostVersion::new(3, 5, 0)));
        let err = Runtime::new(host, RuntimeOptions::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::IncompatibleHost { .. }));
    }

    #[test]
    fn test_missing_destructor() {
        let host = MockHost::new();
        host.remove_destructor(ResourceKind::Dictionary);
        let err = Runtime::new(Arc::new(host), RuntimeOptions::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::Abi(AbiError::MissingFunction(_))));
    }

    #[test]
    fn test_levels() {
        let host = Arc::new(MockHost::new());
        let runtime = Runtime::new(host, RuntimeOptions::default()).unwrap();
        assert_eq!(runtime.level(), None);

        runtime.initialize(InitLevel::Core).unwrap();
        runtime.initialize(InitLevel::Servers).unwrap();
        assert!(!runtime.registry().is_ready());
        runtime.initialize(InitLevel::Scene).unwrap();
        assert!(runtime.registry().is_ready());
        assert_eq!(runtime.level(), Some(InitLevel::Scene));

        runtime.deinitialize(InitLevel::Scene);
        assert!(!runtime.registry().is_ready());
        assert_eq!(runtime.level(), Some(InitLevel::Servers));
        runtime.deinitialize(InitLevel::Servers);
        runtime.deinitialize(InitLevel::Core);
        assert_eq!(runtime.level(), None);
    }
}
