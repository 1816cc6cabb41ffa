use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::env;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// Every key that starts with `<PLUGIN>_`, where `<PLUGIN>` is the upper
    /// cased plugin name with dashes and dots turned into underscores.
    pub async fn plugin_settings(&self, plugin: &str) -> HashMap<String, String> {
        let prefix = format!("{}_", plugin.to_uppercase().replace(['-', '.', ' '], "_"));
        self.0
            .as_vec()
            .await
            .into_iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .collect()
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("no .env at {}, using the process environment only", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed runtime settings read through a [`ConfigManager`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub plugins_dir: PathBuf,
    pub workers: usize,
    pub log_store_jobs: usize,
    pub public_key: Option<PathBuf>,
    pub signature_alg: String,
    pub http_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub describe_timeout: Duration,
    pub on_loaded_timeout: Duration,
    pub watch_plugins: bool,
}

impl RuntimeConfig {
    pub async fn load(root: &Path, config: &ConfigManager) -> anyhow::Result<Self> {
        let get = |key: &'static str| async move { config.0.get(key).await.filter(|v| !v.trim().is_empty()) };

        let plugins_dir = get("CHAINOPS_PLUGINS_DIR")
            .await
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("plugins"));

        Ok(Self {
            root: root.to_path_buf(),
            plugins_dir,
            workers: parse_or(get("CHAINOPS_WORKERS").await, "CHAINOPS_WORKERS", 4)?,
            log_store_jobs: parse_or(get("CHAINOPS_LOG_STORE_JOBS").await, "CHAINOPS_LOG_STORE_JOBS", 100)?,
            public_key: get("CHAINOPS_PUBLIC_KEY").await.map(PathBuf::from),
            signature_alg: get("CHAINOPS_SIGNATURE_ALG").await.unwrap_or_else(|| "EdDSA".to_string()),
            http_addr: parse_or(
                get("CHAINOPS_HTTP_ADDR").await,
                "CHAINOPS_HTTP_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 8080)),
            )?,
            ws_addr: parse_or(
                get("CHAINOPS_WS_ADDR").await,
                "CHAINOPS_WS_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 8081)),
            )?,
            describe_timeout: Duration::from_millis(parse_or(
                get("CHAINOPS_DESCRIBE_TIMEOUT_MS").await,
                "CHAINOPS_DESCRIBE_TIMEOUT_MS",
                5_000,
            )?),
            on_loaded_timeout: Duration::from_millis(parse_or(
                get("CHAINOPS_ON_LOADED_TIMEOUT_MS").await,
                "CHAINOPS_ON_LOADED_TIMEOUT_MS",
                10_000,
            )?),
            watch_plugins: parse_or(get("CHAINOPS_WATCH_PLUGINS").await, "CHAINOPS_WATCH_PLUGINS", true)?,
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value `{raw}` for {key}: {e}")),
    }
}
