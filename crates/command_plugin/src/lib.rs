pub mod capability;
pub mod jsonrpc;
pub mod message;
pub mod payload;
pub mod plugin_runtime;

pub use capability::{Backend, Capability, CommandHandler, CommandLog, ExecutionContext, Runnable, ServicePlugin};
pub use message::{CommandOutcome, HostContext, LogLevel};
