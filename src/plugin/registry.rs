use std::sync::{Arc, Mutex};

use command_plugin::capability::{Backend, Capability, CommandHandler, ServicePlugin};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::descriptor::PluginDescriptor;
use super::unit::{IsolationUnit, UnitLease};
use crate::error::{DispatchError, RegistryError};

struct CommandBinding {
    handler: Arc<dyn CommandHandler>,
    backend_name: String,
    unit: Arc<IsolationUnit>,
}

struct BackendBinding {
    service: Arc<dyn ServicePlugin>,
    unit: Arc<IsolationUnit>,
}

struct UnitEntry {
    descriptor: PluginDescriptor,
    unit: Arc<IsolationUnit>,
}

/// A handler resolved for one command, with a lease on its unit.
pub struct ResolvedHandler {
    pub handler: Arc<dyn CommandHandler>,
    pub backend_name: String,
    pub lease: UnitLease,
}

pub struct ResolvedBackend {
    pub backend: Arc<dyn Backend>,
    pub lease: UnitLease,
}

/// Dispatch table (command name -> handler) and service table
/// (backend name -> service), indexed by isolation unit for removal.
///
/// Reads go straight to the concurrent maps. Writers serialise on a small
/// lock so that conflict checks and inserts happen as one step.
#[derive(Default)]
pub struct PluginRegistry {
    commands: DashMap<String, CommandBinding>,
    backends: DashMap<String, BackendBinding>,
    units: DashMap<Uuid, UnitEntry>,
    writer: Mutex<()>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers whichever capability `descriptor` describes.
    pub fn register(
        &self,
        descriptor: PluginDescriptor,
        capability: Capability,
        unit: Arc<IsolationUnit>,
    ) -> Result<(), RegistryError> {
        match capability {
            Capability::Handler { handler, .. } => self.register_handler(descriptor, handler, unit),
            Capability::Backend(service) => self.register_backend(descriptor, service, unit),
        }
    }

    pub fn register_handler(
        &self,
        descriptor: PluginDescriptor,
        handler: Arc<dyn CommandHandler>,
        unit: Arc<IsolationUnit>,
    ) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        for command in &descriptor.command_names {
            if let Some(existing) = self.commands.get(command) {
                return Err(RegistryError::CommandTaken {
                    command: command.clone(),
                    owner: existing.unit.plugin().to_string(),
                });
            }
        }

        for command in &descriptor.command_names {
            self.commands.insert(
                command.clone(),
                CommandBinding {
                    handler: Arc::clone(&handler),
                    backend_name: descriptor.backend_name.clone(),
                    unit: Arc::clone(&unit),
                },
            );
        }
        info!(
            plugin = %descriptor.name,
            unit = %descriptor.unit_id,
            commands = ?descriptor.command_names,
            "handler registered"
        );
        self.units.insert(descriptor.unit_id, UnitEntry { descriptor, unit });
        Ok(())
    }

    pub fn register_backend(
        &self,
        descriptor: PluginDescriptor,
        service: Arc<dyn ServicePlugin>,
        unit: Arc<IsolationUnit>,
    ) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.backends.get(&descriptor.backend_name) {
            return Err(RegistryError::BackendTaken {
                backend: descriptor.backend_name.clone(),
                owner: existing.unit.plugin().to_string(),
            });
        }

        self.backends.insert(
            descriptor.backend_name.clone(),
            BackendBinding { service, unit: Arc::clone(&unit) },
        );
        info!(
            plugin = %descriptor.name,
            unit = %descriptor.unit_id,
            backend = %descriptor.backend_name,
            "backend registered"
        );
        self.units.insert(descriptor.unit_id, UnitEntry { descriptor, unit });
        Ok(())
    }

    /// Looks up the handler bound to `command` and leases its unit.
    pub fn resolve(&self, command: &str) -> Result<ResolvedHandler, DispatchError> {
        let not_found = || DispatchError::CommandNotFound(command.to_string());
        let binding = self.commands.get(command).ok_or_else(not_found)?;
        let lease = binding.unit.enter().ok_or_else(not_found)?;
        Ok(ResolvedHandler {
            handler: Arc::clone(&binding.handler),
            backend_name: binding.backend_name.clone(),
            lease,
        })
    }

    pub fn resolve_backend(&self, backend: &str) -> Result<ResolvedBackend, DispatchError> {
        let not_found = || DispatchError::BackendNotFound(backend.to_string());
        let binding = self.backends.get(backend).ok_or_else(not_found)?;
        let lease = binding.unit.enter().ok_or_else(not_found)?;
        Ok(ResolvedBackend { backend: binding.service.get_instance(), lease })
    }

    /// Removes every binding owned by `unit_id`. The unit is closed first so
    /// its names stop resolving at once; draining is left to the caller.
    pub fn deregister(&self, unit_id: Uuid) -> Option<(PluginDescriptor, Arc<IsolationUnit>)> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let (_, entry) = self.units.remove(&unit_id)?;
        entry.unit.close();

        self.commands.retain(|_, binding| binding.unit.id() != unit_id);
        self.backends.retain(|_, binding| binding.unit.id() != unit_id);
        debug!(plugin = %entry.descriptor.name, unit = %unit_id, "bindings removed");
        Some((entry.descriptor, entry.unit))
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<_> = self.units.iter().map(|e| e.descriptor.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Units loaded from the plugin directory `name`.
    pub fn units_for_plugin(&self, name: &str) -> Vec<Uuid> {
        self.units
            .iter()
            .filter(|e| e.descriptor.name == name)
            .map(|e| *e.key())
            .collect()
    }

    pub fn unit_ids(&self) -> Vec<Uuid> {
        self.units.iter().map(|e| *e.key()).collect()
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.commands.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
