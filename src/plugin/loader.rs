//! Module Loader: finds plugin directories, starts each plugin in a fresh
//! isolation unit, introspects its single capability and registers it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use command_plugin::capability::Capability;
use command_plugin::message::{CapabilityKind, CapabilityManifest, HostContext, LogLevel};
use semver::Version;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::descriptor::PluginDescriptor;
use super::registry::PluginRegistry;
use super::remote::{self, PluginProcess, RemoteHandler, RemoteService};
use super::unit::IsolationUnit;
use crate::config::ConfigManager;
use crate::error::PluginLoadError;

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Bound on the `describe` answer of a freshly started plugin.
    pub describe_timeout: Duration,
    pub on_loaded_timeout: Duration,
    pub log_level: LogLevel,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            describe_timeout: Duration::from_secs(5),
            on_loaded_timeout: Duration::from_secs(10),
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Debug)]
pub struct SkippedPlugin {
    pub dir: PathBuf,
    pub error: PluginLoadError,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub loaded: Vec<PluginDescriptor>,
    pub skipped: Vec<SkippedPlugin>,
}

pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    config: ConfigManager,
    settings: LoaderSettings,
}

impl PluginLoader {
    pub fn new(registry: Arc<PluginRegistry>, config: ConfigManager, settings: LoaderSettings) -> Self {
        Self { registry, config, settings }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Loads every plugin directory directly under `root`. A plugin that
    /// fails is logged and reported; the rest still load.
    pub async fn discover(&self, root: &Path) -> Result<DiscoveryReport, PluginLoadError> {
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await.map_err(io_at(root))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_at(root))? {
            let path = entry.path();
            if !is_hidden(&path) && is_dir(&path).await {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut report = DiscoveryReport::default();
        for dir in dirs {
            match self.load_dir(&dir).await {
                Ok(descriptor) => report.loaded.push(descriptor),
                Err(error) => {
                    warn!(dir = %dir.display(), "skipping plugin: {error}");
                    report.skipped.push(SkippedPlugin { dir, error });
                }
            }
        }
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "plugin discovery finished in {}",
            root.display()
        );
        Ok(report)
    }

    /// Loads one plugin directory into a fresh isolation unit.
    pub async fn load_dir(&self, dir: &Path) -> Result<PluginDescriptor, PluginLoadError> {
        let name = plugin_name(dir);
        let (binary, version) = locate_binary(dir, &name).await?;

        let process = PluginProcess::spawn(&binary, &name)?;
        let result = self.introspect(&name, dir, binary, version, Arc::clone(&process)).await;
        if result.is_err() {
            process.shutdown().await;
        }
        result
    }

    async fn introspect(
        &self,
        name: &str,
        dir: &Path,
        binary: PathBuf,
        version: Option<Version>,
        process: Arc<PluginProcess>,
    ) -> Result<PluginDescriptor, PluginLoadError> {
        let timeout = self.settings.describe_timeout;
        let described = match tokio::time::timeout(timeout, remote::describe(&process)).await {
            Ok(described) => described.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no answer within {timeout:?}")),
        }
        .map_err(|details| PluginLoadError::Introspection { plugin: name.to_string(), stage: "describe", details })?;
        let manifest = single_manifest(name, described.capabilities)?;

        let capability = match manifest.kind {
            CapabilityKind::Handler => Capability::handler(
                manifest.name.clone(),
                Arc::new(RemoteHandler::new(Arc::clone(&process), manifest.clone())),
            ),
            CapabilityKind::Backend => Capability::backend(Arc::new(RemoteService::new(
                Arc::clone(&process),
                manifest.backend_name.clone(),
            ))),
        };

        let unit_id = Uuid::new_v4();
        let unit = IsolationUnit::remote(unit_id, name, process);
        let descriptor =
            PluginDescriptor::from_manifest(name, &manifest, unit_id, binary, dir.to_path_buf(), version);
        self.install(descriptor, capability, unit).await
    }

    /// Registers a capability that lives inside the host under its own unit.
    pub async fn load_in_process(
        &self,
        name: &str,
        capability: Capability,
    ) -> Result<PluginDescriptor, PluginLoadError> {
        let manifest = single_manifest(name, vec![capability.manifest()])?;
        let unit = IsolationUnit::in_process(name);
        let descriptor =
            PluginDescriptor::from_manifest(name, &manifest, unit.id(), PathBuf::new(), PathBuf::new(), None);
        self.install(descriptor, capability, unit).await
    }

    async fn install(
        &self,
        descriptor: PluginDescriptor,
        capability: Capability,
        unit: Arc<IsolationUnit>,
    ) -> Result<PluginDescriptor, PluginLoadError> {
        let unit_id = descriptor.unit_id;
        let name = descriptor.name.clone();
        self.registry.register(descriptor.clone(), capability.clone(), unit)?;

        let ctx = HostContext {
            unit_id: unit_id.to_string(),
            plugin_name: name.clone(),
            config: self.config.plugin_settings(&name).await,
            log_level: self.settings.log_level,
        };
        let timeout = self.settings.on_loaded_timeout;
        let failure = match tokio::time::timeout(timeout, capability.on_loaded(&ctx)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!("did not finish within {timeout:?}")),
        };
        if let Some(details) = failure {
            self.registry.deregister(unit_id);
            return Err(PluginLoadError::Introspection { plugin: name, stage: "onLoaded", details });
        }

        info!(plugin = %name, unit = %unit_id, version = ?descriptor.version, "plugin loaded");
        Ok(descriptor)
    }

    /// Removes every binding of `unit_id`, waits for in-flight calls into the
    /// unit to finish, then stops it. Returns false for an unknown unit.
    pub async fn unload(&self, unit_id: Uuid) -> bool {
        let Some((descriptor, unit)) = self.registry.deregister(unit_id) else {
            return false;
        };
        unit.terminate().await;
        info!(plugin = %descriptor.name, unit = %unit_id, "plugin unloaded");
        true
    }

    /// Unloads every unit that was loaded from the plugin directory `name`.
    pub async fn unload_plugin(&self, name: &str) -> usize {
        let mut count = 0;
        for unit_id in self.registry.units_for_plugin(name) {
            if self.unload(unit_id).await {
                count += 1;
            }
        }
        count
    }

    /// Replaces whatever is loaded from `dir` with a fresh unit. A directory
    /// that no longer exists is only unloaded.
    pub async fn reload(&self, dir: &Path) -> Result<Option<PluginDescriptor>, PluginLoadError> {
        let name = plugin_name(dir);
        self.unload_plugin(&name).await;
        if !is_dir(dir).await {
            return Ok(None);
        }
        self.load_dir(dir).await.map(Some)
    }

    pub async fn shutdown(&self) {
        for unit_id in self.registry.unit_ids() {
            self.unload(unit_id).await;
        }
    }
}

fn plugin_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_string())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

/// Version selection and binary lookup walk the directory synchronously, so
/// they run on the blocking pool.
async fn locate_binary(dir: &Path, plugin: &str) -> Result<(PathBuf, Option<Version>), PluginLoadError> {
    let (dir_owned, plugin) = (dir.to_path_buf(), plugin.to_string());
    tokio::task::spawn_blocking(move || {
        let (version_dir, version) = select_version_dir(&dir_owned)?;
        Ok::<_, PluginLoadError>((find_binary(&version_dir, &plugin)?, version))
    })
    .await
    .map_err(|e| PluginLoadError::IoAt { path: dir.to_path_buf(), source: std::io::Error::other(e) })?
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn io_at(path: &Path) -> impl Fn(std::io::Error) -> PluginLoadError + '_ {
    move |source| PluginLoadError::IoAt { path: path.to_path_buf(), source }
}

/// The child directory named after the highest semantic version, or `dir`
/// itself when there is none.
pub fn select_version_dir(dir: &Path) -> Result<(PathBuf, Option<Version>), PluginLoadError> {
    let mut best: Option<(Version, PathBuf)> = None;
    for entry in fs::read_dir(dir).map_err(io_at(dir))? {
        let path = entry.map_err(io_at(dir))?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(version) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Version::parse(n.trim_start_matches('v')).ok())
        else {
            continue;
        };
        if best.as_ref().is_none_or(|(current, _)| version > *current) {
            best = Some((version, path));
        }
    }
    Ok(match best {
        Some((version, path)) => (path, Some(version)),
        None => (dir.to_path_buf(), None),
    })
}

/// The single executable in `dir`, or the one named after the plugin when
/// there are several.
pub fn find_binary(dir: &Path, plugin: &str) -> Result<PathBuf, PluginLoadError> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_at(dir))? {
        let path = entry.map_err(io_at(dir))?.path();
        if path.is_file() && !is_hidden(&path) && is_executable(&path) {
            candidates.push(path);
        }
    }
    candidates.sort();

    match candidates.len() {
        0 => Err(PluginLoadError::NoBinary(dir.to_path_buf())),
        1 => Ok(candidates.remove(0)),
        _ => candidates
            .into_iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(plugin))
            .ok_or_else(|| PluginLoadError::AmbiguousBinary(dir.to_path_buf())),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("exe"))
}

/// Exactly one capability, and for a handler a non-empty set of unique names.
fn single_manifest(
    plugin: &str,
    mut capabilities: Vec<CapabilityManifest>,
) -> Result<CapabilityManifest, PluginLoadError> {
    let manifest = match capabilities.len() {
        0 => return Err(PluginLoadError::NoCapability { plugin: plugin.to_string() }),
        1 => capabilities.remove(0),
        count => {
            error!(plugin, count, "plugin exports more than one capability");
            return Err(PluginLoadError::MultipleCapabilities { plugin: plugin.to_string(), count });
        }
    };

    if manifest.kind == CapabilityKind::Handler {
        if manifest.command_names.is_empty() {
            return Err(PluginLoadError::NoCommands { plugin: plugin.to_string() });
        }
        let mut seen = std::collections::HashSet::new();
        for command in &manifest.command_names {
            if !seen.insert(command) {
                return Err(PluginLoadError::DuplicateCommand {
                    plugin: plugin.to_string(),
                    command: command.clone(),
                });
            }
        }
    }
    Ok(manifest)
}
