//! The capability contracts every plugin satisfies, whether it runs inside the
//! host or behind a JSON-RPC pipe in its own process.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::message::{CapabilityKind, CapabilityManifest, CommandOutcome, HostContext, LogLevel};

/// A named capability that handlers invoke. Instances are shared across
/// concurrent chains and must be internally safe for concurrent use.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, operation: &str, args: Value) -> anyhow::Result<Value>;
}

/// Service plugin contract: exposes one named backend.
#[async_trait]
pub trait ServicePlugin: Send + Sync {
    fn name(&self) -> String;

    fn get_instance(&self) -> Arc<dyn Backend>;

    /// Invoked once after registration, e.g. to open a persistent connection.
    /// Must not block indefinitely.
    async fn on_loaded(&self, _ctx: &HostContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink for job-scoped log lines written by a running command.
pub trait CommandLog: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Log sink that only forwards to `tracing`.
#[derive(Clone, Debug, Default)]
pub struct TracingLog;

impl CommandLog for TracingLog {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Critical => tracing::error!("[CRITICAL] {message}"),
        }
    }
}

/// Everything a runnable gets besides its backend.
#[derive(Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub log: Arc<dyn CommandLog>,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, log: Arc<dyn CommandLog>) -> Self {
        Self { cancel, log }
    }

    pub fn info(&self, message: &str) {
        self.log.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log.log(LogLevel::Error, message);
    }
}

/// A typed command built from a payload, ready to run against its backend.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// True when this step may only start once the chain entry right before
    /// it has finished.
    fn requires_previous_completion(&self) -> bool;

    async fn execute(&self, backend: Arc<dyn Backend>, ctx: &ExecutionContext) -> CommandOutcome;
}

/// Handler contract: turns a command name plus untyped payload into a runnable.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn command_names(&self) -> Vec<String>;

    fn backend_name(&self) -> String;

    /// Build never rejects a payload for missing or malformed fields; those
    /// take their declared defaults and surface only when execution needs them.
    async fn build(&self, command: &str, payload: &Value) -> anyhow::Result<Box<dyn Runnable>>;

    async fn on_loaded(&self, _ctx: &HostContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One exported capability of a plugin module.
#[derive(Clone)]
pub enum Capability {
    Handler { name: String, handler: Arc<dyn CommandHandler> },
    Backend(Arc<dyn ServicePlugin>),
}

impl Capability {
    pub fn handler(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Capability::Handler { name: name.into(), handler }
    }

    pub fn backend(service: Arc<dyn ServicePlugin>) -> Self {
        Capability::Backend(service)
    }

    pub fn manifest(&self) -> CapabilityManifest {
        match self {
            Capability::Handler { name, handler } => CapabilityManifest {
                kind: CapabilityKind::Handler,
                name: name.clone(),
                command_names: handler.command_names(),
                backend_name: handler.backend_name(),
            },
            Capability::Backend(service) => CapabilityManifest {
                kind: CapabilityKind::Backend,
                name: service.name(),
                command_names: vec![],
                backend_name: service.name(),
            },
        }
    }

    pub async fn on_loaded(&self, ctx: &HostContext) -> anyhow::Result<()> {
        match self {
            Capability::Handler { handler, .. } => handler.on_loaded(ctx).await,
            Capability::Backend(service) => service.on_loaded(ctx).await,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Capability").field(&self.manifest()).finish()
    }
}
