#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chainops::app::App;
use chainops::config::{ConfigManager, MapConfigManager, RuntimeConfig};
use chainops::job::{JobState, JobStatusRecord};
use chainops::plugin::{LoaderSettings, PluginLoader, PluginRegistry};
use chainops::service::JobService;
use command_plugin::message::LogLevel;
use tempfile::TempDir;

/// A scratch root on the same filesystem as the built binaries, so plugin
/// executables can be hard linked instead of copied.
pub fn scratch_root() -> TempDir {
    tempfile::Builder::new()
        .prefix("chainops-")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .unwrap()
}

/// Installs the mock plugin as `<plugins>/<dir>[/<version>]/<binary>`.
pub fn install_plugin(plugins: &Path, dir: &str, version: Option<&str>, binary: &str) -> PathBuf {
    let mut target = plugins.join(dir);
    if let Some(version) = version {
        target = target.join(version);
    }
    std::fs::create_dir_all(&target).unwrap();
    let exe = target.join(binary);
    if exe.exists() {
        return exe;
    }
    let source = Path::new(env!("CARGO_BIN_EXE_mock_plugin"));
    if std::fs::hard_link(source, &exe).is_err() {
        std::fs::copy(source, &exe).unwrap();
    }
    exe
}

/// The usual pair: a handler plugin and the `mock-backend` it calls.
pub fn install_pair(plugins: &Path, handler: &str) {
    install_plugin(plugins, handler, Some("1.0.0"), handler);
    install_plugin(plugins, "mock-backend", None, "mock-backend");
}

pub fn loader() -> Arc<PluginLoader> {
    Arc::new(PluginLoader::new(
        Arc::new(PluginRegistry::new()),
        ConfigManager(MapConfigManager::new()),
        LoaderSettings {
            describe_timeout: Duration::from_secs(2),
            on_loaded_timeout: Duration::from_secs(5),
            log_level: LogLevel::Warn,
        },
    ))
}

/// Boots a full host on ephemeral ports with hot reload off.
pub async fn boot(root: &Path, extra: &[(&str, &str)]) -> App {
    let plugins = root.join("plugins");
    let plugins = plugins.to_string_lossy().into_owned();
    let mut pairs = vec![
        ("CHAINOPS_PLUGINS_DIR", plugins.as_str()),
        ("CHAINOPS_HTTP_ADDR", "127.0.0.1:0"),
        ("CHAINOPS_WS_ADDR", "127.0.0.1:0"),
        ("CHAINOPS_WATCH_PLUGINS", "false"),
        ("CHAINOPS_WORKERS", "2"),
    ];
    pairs.extend_from_slice(extra);
    let config = ConfigManager(MapConfigManager::from_pairs(pairs));
    let runtime = RuntimeConfig::load(root, &config).await.unwrap();
    App::bootstrap(runtime, config, LogLevel::Warn).await.unwrap()
}

pub async fn wait_for_terminal(service: &JobService, id: &str) -> JobStatusRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(status) = service.status(id) {
                if status.status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

pub fn assert_state(status: &JobStatusRecord, state: JobState) {
    assert_eq!(status.status, state, "unexpected status: {status:#?}");
}
