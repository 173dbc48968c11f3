//! Module registry with dependency-checked lifecycle.
//!
//! The registry owns every registered module, tracks its lifecycle state,
//! and drives the `load -> enable -> disable -> shutdown` state machine.
//! An insertion-ordered load list makes bulk load/enable deterministic and
//! drives reverse-order shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::api::KernelApi;
use crate::bus::EventBus;
use crate::config::ConfigSection;
use crate::error::{KernelError, Result};
use crate::module::{Module, ModuleEventHandler, ModuleState};

struct ModuleEntry {
    module: Arc<dyn Module>,
    state: ModuleState,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, ModuleEntry>,
    load_order: Vec<String>,
}

/// Registry of kernel modules.
pub struct ModuleRegistry {
    api: Arc<KernelApi>,
    bus: Arc<EventBus>,
    inner: RwLock<RegistryInner>,
}

impl ModuleRegistry {
    pub fn new(api: Arc<KernelApi>, bus: Arc<EventBus>) -> Self {
        Self {
            api,
            bus,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a module: grant its declared permissions and hook it into
    /// the event bus.  The module starts `Unloaded`.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<()> {
        let name = module.name().to_string();

        if module.dependencies().contains(&name) {
            return Err(KernelError::SelfDependency { name });
        }

        let mut inner = self.inner.write();
        if inner.entries.contains_key(&name) {
            return Err(KernelError::ModuleAlreadyRegistered { name });
        }

        self.api
            .grant_permissions(&name, module.required_permissions());
        self.bus
            .register_handler(&name, Arc::new(ModuleEventHandler(Arc::clone(&module))));

        inner.entries.insert(
            name.clone(),
            ModuleEntry {
                module,
                state: ModuleState::Unloaded,
            },
        );
        inner.load_order.push(name.clone());

        tracing::info!(module = %name, "module registered");
        Ok(())
    }

    /// Load a module.  Every declared dependency must already be `Loaded`
    /// or `Enabled`.
    pub fn load(&self, name: &str, config: &ConfigSection) -> Result<()> {
        let module = self.get(name)?;

        for dep in module.dependencies() {
            let dep_state = self.state(&dep);
            match dep_state {
                None => {
                    return Err(KernelError::DependencyNotRegistered { name: dep });
                }
                Some(ModuleState::Loaded) | Some(ModuleState::Enabled) => {}
                Some(_) => {
                    return Err(KernelError::DependencyNotLoaded { name: dep });
                }
            }
        }

        if let Err(err) = module.load(config) {
            self.set_state(name, ModuleState::Error);
            return Err(KernelError::ModuleHookFailed {
                name: name.to_string(),
                stage: "load",
                reason: err.to_string(),
            });
        }

        self.set_state(name, ModuleState::Loaded);
        tracing::info!(module = name, "module loaded");
        Ok(())
    }

    /// Enable a module.  Valid from `Loaded` or `Disabled`.
    pub fn enable(&self, name: &str) -> Result<()> {
        let module = self.get(name)?;

        let state = self.state(name).unwrap_or(ModuleState::Unloaded);
        if state != ModuleState::Loaded && state != ModuleState::Disabled {
            return Err(KernelError::ModuleNotLoadedYet {
                name: name.to_string(),
                state,
            });
        }

        if let Err(err) = module.enable() {
            self.set_state(name, ModuleState::Error);
            return Err(KernelError::ModuleHookFailed {
                name: name.to_string(),
                stage: "enable",
                reason: err.to_string(),
            });
        }

        self.set_state(name, ModuleState::Enabled);
        tracing::info!(module = name, "module enabled");
        Ok(())
    }

    /// Disable a module.  A no-op unless it is currently `Enabled`.
    pub fn disable(&self, name: &str) -> Result<()> {
        let Ok(module) = self.get(name) else {
            return Ok(());
        };
        if self.state(name) != Some(ModuleState::Enabled) {
            return Ok(());
        }

        module.disable().map_err(|err| KernelError::ModuleHookFailed {
            name: name.to_string(),
            stage: "disable",
            reason: err.to_string(),
        })?;

        self.set_state(name, ModuleState::Disabled);
        tracing::info!(module = name, "module disabled");
        Ok(())
    }

    /// Shut a module down, disabling it first if needed.  Returns it to
    /// `Unloaded`.
    pub fn shutdown(&self, name: &str) -> Result<()> {
        let Ok(module) = self.get(name) else {
            return Ok(());
        };

        if self.state(name) == Some(ModuleState::Enabled) {
            self.disable(name)?;
        }

        module
            .shutdown()
            .map_err(|err| KernelError::ModuleHookFailed {
                name: name.to_string(),
                stage: "shutdown",
                reason: err.to_string(),
            })?;

        self.set_state(name, ModuleState::Unloaded);
        tracing::info!(module = name, "module shut down");
        Ok(())
    }

    /// Remove a module entirely: shutdown (if needed), revoke permissions,
    /// unhook from the bus, forget.
    pub fn unregister(&self, name: &str) {
        if self.state(name).is_some_and(|s| s != ModuleState::Unloaded) {
            let _ = self.shutdown(name);
        }

        self.api.revoke_permissions(name);
        self.bus.unregister_handler(name);

        let mut inner = self.inner.write();
        inner.entries.remove(name);
        inner.load_order.retain(|n| n != name);

        tracing::info!(module = name, "module unregistered");
    }

    /// Current state of a module.
    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.inner.read().entries.get(name).map(|e| e.state)
    }

    /// Module names in registration (load) order.
    pub fn module_names(&self) -> Vec<String> {
        self.inner.read().load_order.clone()
    }

    /// Shut all modules down in reverse load order.
    pub fn shutdown_all(&self) {
        let names = self.module_names();
        for name in names.iter().rev() {
            if let Err(err) = self.shutdown(name) {
                tracing::error!(module = %name, error = %err, "module shutdown failed");
            }
        }
    }

    fn get(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.inner
            .read()
            .entries
            .get(name)
            .map(|e| Arc::clone(&e.module))
            .ok_or_else(|| KernelError::ModuleNotFound {
                name: name.to_string(),
            })
    }

    fn set_state(&self, name: &str, state: ModuleState) {
        if let Some(entry) = self.inner.write().entries.get_mut(name) {
            entry.state = state;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
