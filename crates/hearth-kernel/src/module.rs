//! Module contract.
//!
//! A module is a named, permissioned in-process capability with a five-state
//! lifecycle driven by the [`ModuleRegistry`].  Modules communicate through
//! the event bus and reach kernel services through [`KernelApi`]; they hold
//! a non-owning `Arc` to the API, whose lifetime strictly exceeds any
//! module's.
//!
//! [`ModuleRegistry`]: crate::registry::ModuleRegistry
//! [`KernelApi`]: crate::api::KernelApi

use std::collections::BTreeSet;

use crate::bus::{EventData, EventHandler};
use crate::config::ConfigSection;
use crate::error::Result;
use crate::permission::Permission;

/// Lifecycle state of a module, tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    /// Registered but not yet loaded (initial), or shut down.
    Unloaded,
    /// Resources initialized, ready to enable.
    Loaded,
    /// Actively running.
    Enabled,
    /// Paused; resources retained.
    Disabled,
    /// A load or enable hook failed; only unregister leaves this state.
    Error,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// An isolated kernel capability.
///
/// Lifecycle hooks take `&self`; modules that carry mutable state use
/// interior mutability.  `handle_event` is invoked from the event bus worker
/// thread and must not block for long.
pub trait Module: EventHandler {
    /// Unique module name; doubles as the registry and permission key.
    fn name(&self) -> &str;

    /// The permission set this module needs.  Granted verbatim at
    /// registration time.
    fn required_permissions(&self) -> Permission;

    /// Names of modules that must be loaded before this one.
    fn dependencies(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Initialize resources from the module's configuration section.
    fn load(&self, config: &ConfigSection) -> Result<()>;

    /// Start active operations.
    fn enable(&self) -> Result<()>;

    /// Stop active operations but keep resources.
    fn disable(&self) -> Result<()>;

    /// Release all resources.
    fn shutdown(&self) -> Result<()>;
}

/// Forwarder so a `dyn Module` can be handed to the event bus as its own
/// `dyn EventHandler` without trait upcasting.
pub(crate) struct ModuleEventHandler(pub std::sync::Arc<dyn Module>);

impl EventHandler for ModuleEventHandler {
    fn handle_event(&self, event_type: &str, data: &EventData) {
        self.0.handle_event(event_type, data);
    }
}
