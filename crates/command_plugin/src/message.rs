use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The status string that marks a successful command. Every other status is
/// an application-level error message.
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Result of running one command of a chain. Produced exactly once per execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub status: String,
}

impl CommandOutcome {
    pub fn success(payload: Option<Value>) -> Self {
        Self { payload, status: STATUS_SUCCESS.to_string() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut status = message.into();
        // an error must never masquerade as the success sentinel
        if status == STATUS_SUCCESS || status.is_empty() {
            status = format!("error: {status}");
        }
        Self { payload: None, status }
    }

    pub fn cancelled() -> Self {
        Self { payload: None, status: STATUS_CANCELLED.to_string() }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == STATUS_CANCELLED
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Handler,
    Backend,
}

/// What one exported capability says about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityManifest {
    pub kind: CapabilityKind,
    pub name: String,
    /// Handler only: the command names it answers to.
    #[serde(default)]
    pub command_names: Vec<String>,
    /// Handler: backend it needs. Backend: the name it exposes.
    pub backend_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DescribeResult {
    pub capabilities: Vec<CapabilityManifest>,
}

/// Handed to a capability once, right after it has been registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostContext {
    pub unit_id: String,
    pub plugin_name: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildParams {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub requires_previous_completion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub execution_id: String,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeParams {
    pub operation: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeBackendParams {
    pub execution_id: String,
    pub operation: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogParams {
    pub execution_id: String,
    pub level: LogLevel,
    pub message: String,
}
