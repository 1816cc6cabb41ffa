use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

use crate::plugin::PluginLoader;

/// Something that reacts to changes below a watched directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;

    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;
}

/// Polls `dir` recursively and forwards relevant events to a [`WatchedType`].
/// Dropping it or calling [`shutdown`](Self::shutdown) stops both.
pub struct DirectoryWatcher {
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    pub const DEFAULT_POLL: Duration = Duration::from_secs(2);

    /// With `enable_retry`, a failed create/modify handler is retried a few
    /// times before giving up; files are often caught mid-write.
    pub fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        poll_interval: Duration,
        enable_retry: bool,
    ) -> Result<Self> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }

        let (tx, mut rx) = unbounded_channel::<notify::Result<Event>>();
        let mut watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(?e, "Watcher error");
                        continue;
                    }
                };
                let removed = match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => false,
                    EventKind::Remove(_) => true,
                    _ => continue,
                };
                for path in event.paths.into_iter().filter(|p| watched.is_relevant(p)) {
                    let watched = Arc::clone(&watched);
                    tokio::spawn(async move {
                        if removed {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        } else {
                            try_reload(&watched, &path, enable_retry).await;
                        }
                    });
                }
            }
        });

        info!(dir = %dir.display(), "watching for changes");
        Ok(Self { _watcher: watcher, dispatch })
    }

    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.on_create_or_modify(path).await {
            Ok(()) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Maps changes below the plugins root to the plugin directory they belong
/// to and reloads that plugin. A burst of events for one plugin collapses
/// into a single reload once the directory has been quiet for `settle`.
pub struct PluginDirWatcher {
    root: PathBuf,
    loader: Arc<PluginLoader>,
    settle: Duration,
    pending: DashMap<PathBuf, ()>,
}

impl PluginDirWatcher {
    pub fn new(root: PathBuf, loader: Arc<PluginLoader>, settle: Duration) -> Self {
        Self { root, loader, settle, pending: DashMap::new() }
    }

    /// `<root>/<plugin>` for any path at or below it.
    pub fn plugin_dir_for(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.root).ok()?;
        match rel.components().next()? {
            Component::Normal(name) if !name.to_string_lossy().starts_with('.') => Some(self.root.join(name)),
            _ => None,
        }
    }

    async fn reload_settled(&self, path: &Path) -> Result<()> {
        let Some(dir) = self.plugin_dir_for(path) else {
            return Ok(());
        };
        if self.pending.insert(dir.clone(), ()).is_some() {
            return Ok(());
        }
        sleep(self.settle).await;
        self.pending.remove(&dir);

        match self.loader.reload(&dir).await {
            Ok(Some(descriptor)) => {
                info!(plugin = %descriptor.name, unit = %descriptor.unit_id, "plugin reloaded");
                Ok(())
            }
            Ok(None) => {
                info!(dir = %dir.display(), "plugin directory removed; unloaded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WatchedType for PluginDirWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        self.plugin_dir_for(path).is_some()
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        self.reload_settled(path).await
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        self.reload_settled(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigManager, MapConfigManager};
    use crate::plugin::{LoaderSettings, PluginRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        created: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl WatchedType for Counting {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "txt")
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relevant_changes_reach_the_handler() {
        let dir = tempfile::tempdir().unwrap();
        let counting = Arc::new(Counting { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let watcher = DirectoryWatcher::new(
            dir.path().to_path_buf(),
            counting.clone(),
            Duration::from_millis(50),
            false,
        )
        .unwrap();

        let file = dir.path().join("note.txt");
        std::fs::write(&file, "hello").unwrap();
        std::fs::write(dir.path().join("ignored.bin"), "x").unwrap();
        sleep(Duration::from_millis(400)).await;
        assert!(counting.created.load(Ordering::SeqCst) >= 1);

        std::fs::remove_file(&file).unwrap();
        sleep(Duration::from_millis(400)).await;
        assert!(counting.removed.load(Ordering::SeqCst) >= 1);

        watcher.shutdown();
    }

    #[test]
    fn missing_directory_is_an_error() {
        let counting = Arc::new(Counting { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        assert!(
            DirectoryWatcher::new(PathBuf::from("/nonexistent/chainops"), counting, Duration::from_millis(50), false)
                .is_err()
        );
    }

    #[test]
    fn paths_map_to_their_plugin_directory() {
        let loader = Arc::new(PluginLoader::new(
            Arc::new(PluginRegistry::new()),
            ConfigManager(MapConfigManager::new()),
            LoaderSettings::default(),
        ));
        let watcher = PluginDirWatcher::new(PathBuf::from("/srv/plugins"), loader, Duration::from_millis(10));

        assert_eq!(
            watcher.plugin_dir_for(Path::new("/srv/plugins/ldap/1.2.0/ldap")),
            Some(PathBuf::from("/srv/plugins/ldap"))
        );
        assert_eq!(
            watcher.plugin_dir_for(Path::new("/srv/plugins/vm")),
            Some(PathBuf::from("/srv/plugins/vm"))
        );
        assert_eq!(watcher.plugin_dir_for(Path::new("/srv/plugins/.cache/x")), None);
        assert_eq!(watcher.plugin_dir_for(Path::new("/srv/plugins")), None);
        assert_eq!(watcher.plugin_dir_for(Path::new("/etc/passwd")), None);
    }
}
