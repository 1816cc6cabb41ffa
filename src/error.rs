use std::path::PathBuf;

use thiserror::Error;

/// A plugin module could not be loaded or introspected. Always isolated to
/// that one plugin: discovery logs it and moves on.
#[derive(Debug, Error)]
pub enum PluginLoadError {
    #[error("io failed at `{path}`: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no plugin binary found in `{0}`")]
    NoBinary(PathBuf),
    #[error("several candidate binaries in `{0}`; name one after the plugin directory")]
    AmbiguousBinary(PathBuf),
    #[error("could not start `{path}`: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plugin `{plugin}` exports no handler or backend")]
    NoCapability { plugin: String },
    #[error("plugin `{plugin}` exports {count} capabilities, exactly one is allowed")]
    MultipleCapabilities { plugin: String, count: usize },
    #[error("plugin `{plugin}` handler exposes no command names")]
    NoCommands { plugin: String },
    #[error("plugin `{plugin}` handler exposes `{command}` more than once")]
    DuplicateCommand { plugin: String, command: String },
    #[error("plugin `{plugin}` failed during {stage}: {details}")]
    Introspection {
        plugin: String,
        stage: &'static str,
        details: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Binding conflicts inside the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command `{command}` is already bound by plugin `{owner}`")]
    CommandTaken { command: String, owner: String },
    #[error("backend `{backend}` is already bound by plugin `{owner}`")]
    BackendTaken { backend: String, owner: String },
}

/// Unknown command or backend name. Surfaces as one failed outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("command `{0}` not found")]
    CommandNotFound(String),
    #[error("backend `{0}` not found")]
    BackendNotFound(String),
    #[error("could not build command `{command}`: {details}")]
    Build { command: String, details: String },
}

/// A backend call failed or a plugin could not be reached mid-execution.
#[derive(Debug, Error)]
pub enum CommandExecutionError {
    #[error("plugin `{plugin}` is gone")]
    PluginGone { plugin: String },
    #[error("rpc `{method}` to plugin `{plugin}` failed: {details}")]
    Rpc {
        plugin: String,
        method: String,
        details: String,
    },
    #[error("execution `{0}` is unknown to the host")]
    UnknownExecution(String),
}

/// A publisher could not deliver. Swallowed by the fan-out.
#[derive(Debug, Error)]
#[error("delivery through `{publisher}` failed: {details}")]
pub struct TransportDeliveryError {
    pub publisher: String,
    pub details: String,
}

impl TransportDeliveryError {
    pub fn new(publisher: impl Into<String>, details: impl Into<String>) -> Self {
        Self { publisher: publisher.into(), details: details.into() }
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("request carries no signature")]
    Missing,
    #[error("signature does not match the payload")]
    Mismatch,
    #[error("signature could not be checked: {0}")]
    Malformed(String),
    #[error("public key at `{path}` is unusable: {details}")]
    Key { path: PathBuf, details: String },
}

/// Errors reported synchronously to a submitter; nothing is scheduled.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("job `{0}` not found")]
    UnknownJob(String),
    #[error("job `{0}` has already started")]
    AlreadyStarted(String),
    #[error("job `{0}` has already finished")]
    AlreadyFinished(String),
}
