use std::path::PathBuf;

use command_plugin::message::{CapabilityKind, CapabilityManifest};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static record of one loaded plugin module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Name of the plugin directory under the plugins root.
    pub name: String,
    pub kind: CapabilityKind,
    /// Handler only; never empty for a handler.
    pub command_names: Vec<String>,
    /// Handler: the backend it needs. Backend: the name it exposes.
    pub backend_name: String,
    pub unit_id: Uuid,
    pub binary_path: PathBuf,
    pub plugin_dir: PathBuf,
    pub version: Option<Version>,
}

impl PluginDescriptor {
    pub fn from_manifest(
        name: impl Into<String>,
        manifest: &CapabilityManifest,
        unit_id: Uuid,
        binary_path: PathBuf,
        plugin_dir: PathBuf,
        version: Option<Version>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: manifest.kind,
            command_names: manifest.command_names.clone(),
            backend_name: manifest.backend_name.clone(),
            unit_id,
            binary_path,
            plugin_dir,
            version,
        }
    }

    pub fn is_handler(&self) -> bool {
        self.kind == CapabilityKind::Handler
    }
}
