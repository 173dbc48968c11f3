//! Permission-gated kernel API handed to modules.
//!
//! Modules never touch the event bus or configuration directly; every call
//! goes through [`KernelApi`], which checks the caller's granted permission
//! bits.  Denials are logged at WARN and reported as a negative result,
//! never as a panic or an exception across the module boundary.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bus::{EventBus, EventData};
use crate::config::{Config, ConfigSection};
use crate::error::{KernelError, Result};
use crate::permission::Permission;

/// Kernel services exposed to modules, keyed by the caller's declared name.
pub struct KernelApi {
    permissions: RwLock<HashMap<String, Permission>>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
}

impl KernelApi {
    pub fn new(bus: Arc<EventBus>, config: Arc<Config>) -> Self {
        Self {
            permissions: RwLock::new(HashMap::new()),
            bus,
            config,
        }
    }

    /// Grant permission bits to a module (additive).
    pub fn grant_permissions(&self, module_name: &str, perms: Permission) {
        let mut table = self.permissions.write();
        let entry = table.entry(module_name.to_string()).or_default();
        *entry |= perms;
        tracing::debug!(module = module_name, granted = %perms, "permissions granted");
    }

    /// Revoke every permission held by a module.
    pub fn revoke_permissions(&self, module_name: &str) {
        self.permissions.write().remove(module_name);
    }

    /// Whether a module holds all bits of `perm`.
    pub fn check_permission(&self, module_name: &str, perm: Permission) -> bool {
        self.permissions
            .read()
            .get(module_name)
            .map(|granted| granted.contains(perm))
            .unwrap_or(false)
    }

    /// Emit an event on behalf of a module.  Requires `EVENT_EMIT`.
    pub fn emit_event(&self, module_name: &str, event_type: &str, data: EventData) -> bool {
        if self.require(module_name, Permission::EVENT_EMIT).is_err() {
            return false;
        }
        self.bus.emit(event_type, data, module_name)
    }

    /// Subscribe a module to an event type.  Requires `EVENT_SUBSCRIBE`.
    pub fn subscribe_event(&self, module_name: &str, event_type: &str) -> bool {
        if self.require(module_name, Permission::EVENT_SUBSCRIBE).is_err() {
            return false;
        }
        self.bus.subscribe(event_type, module_name)
    }

    /// Check one permission bit, logging the denial.
    fn require(&self, module_name: &str, permission: Permission) -> Result<()> {
        if self.check_permission(module_name, permission) {
            return Ok(());
        }
        let err = KernelError::PermissionDenied {
            module: module_name.to_string(),
            permission,
        };
        tracing::warn!(error = %err, "kernel api call denied");
        Err(err)
    }

    /// The configuration section named after the module, if present.
    pub fn get_config(&self, module_name: &str) -> Option<&ConfigSection> {
        self.config.section(module_name)
    }

    /// Read-only access to the full configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read-only access to the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}
