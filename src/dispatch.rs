use std::sync::Arc;

use command_plugin::capability::{Backend, Runnable};
use serde_json::Value;
use tracing::debug;

use crate::error::DispatchError;
use crate::plugin::{PluginRegistry, UnitLease};

/// A built command, its backend, and leases on the units serving both.
/// The leases are released when this is dropped.
pub struct PreparedCommand {
    pub runnable: Box<dyn Runnable>,
    pub backend: Arc<dyn Backend>,
    _handler_lease: UnitLease,
    _backend_lease: UnitLease,
}

impl PreparedCommand {
    pub fn requires_previous_completion(&self) -> bool {
        self.runnable.requires_previous_completion()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Resolves `command` and its backend, then lets the handler build a
    /// runnable from the untyped payload.
    pub async fn build(&self, command: &str, payload: &Value) -> Result<PreparedCommand, DispatchError> {
        let resolved = self.registry.resolve(command)?;
        let backend = self.registry.resolve_backend(&resolved.backend_name)?;

        let runnable = resolved
            .handler
            .build(command, payload)
            .await
            .map_err(|e| DispatchError::Build { command: command.to_string(), details: format!("{e:#}") })?;

        debug!(
            command,
            backend = %resolved.backend_name,
            waits = runnable.requires_previous_completion(),
            "command built"
        );
        Ok(PreparedCommand {
            runnable,
            backend: backend.backend,
            _handler_lease: resolved.lease,
            _backend_lease: backend.lease,
        })
    }
}
