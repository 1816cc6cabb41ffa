use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use command_plugin::message::LogLevel;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigManager, RuntimeConfig};
use crate::dispatch::Dispatcher;
use crate::engine::ChainEngine;
use crate::fanout::{Fanout, LogStore};
use crate::job::JobStatusStore;
use crate::plugin::{DiscoveryReport, LoaderSettings, PluginLoader, PluginRegistry};
use crate::queue::{InMemoryJobQueue, JobQueue};
use crate::service::JobService;
use crate::signature::SignatureVerifier;
use crate::transport::{SocketHub, SocketPublisher, http, socket};
use crate::watcher::{DirectoryWatcher, PluginDirWatcher};
use crate::worker::{JobRunner, WorkerPool};

/// The running host: loaded plugins, workers, listeners and the watcher.
pub struct App {
    loader: Arc<PluginLoader>,
    service: Arc<JobService>,
    workers: Option<WorkerPool>,
    watcher: Option<DirectoryWatcher>,
    http_task: Option<JoinHandle<()>>,
    socket_task: Option<JoinHandle<()>>,
    http_addr: SocketAddr,
    ws_addr: SocketAddr,
    shutdown: CancellationToken,
    report: DiscoveryReport,
}

impl App {
    /// Bootstraps the host:
    ///   - discovers and loads every plugin under the plugins root
    ///   - starts the worker pool over the in-memory queue
    ///   - binds the HTTP and socket transports
    ///   - watches the plugins root for hot reload
    pub async fn bootstrap(runtime: RuntimeConfig, config: ConfigManager, log_level: LogLevel) -> Result<Self> {
        let shutdown = CancellationToken::new();

        std::fs::create_dir_all(&runtime.plugins_dir)
            .with_context(|| format!("failed to create {}", runtime.plugins_dir.display()))?;
        let verifier = SignatureVerifier::from_config(runtime.public_key.as_deref(), &runtime.signature_alg)?;

        let registry = Arc::new(PluginRegistry::new());
        let loader = Arc::new(PluginLoader::new(
            Arc::clone(&registry),
            config,
            LoaderSettings {
                describe_timeout: runtime.describe_timeout,
                on_loaded_timeout: runtime.on_loaded_timeout,
                log_level,
            },
        ));
        let report = loader.discover(&runtime.plugins_dir).await?;
        for skipped in &report.skipped {
            error!(dir = %skipped.dir.display(), "plugin not loaded: {}", skipped.error);
        }

        let hub = Arc::new(SocketHub::new());
        let socket_publisher = Arc::new(SocketPublisher::new(Arc::clone(&hub)));
        let fanout = Arc::new(
            Fanout::new(Arc::new(LogStore::new(runtime.log_store_jobs)))
                .with_log_publisher(socket_publisher.clone())
                .with_result_publisher(socket_publisher),
        );

        let engine = ChainEngine::new(Dispatcher::new(Arc::clone(&registry)));
        let statuses = Arc::new(JobStatusStore::new());
        let runner = Arc::new(JobRunner::new(engine, statuses, fanout, shutdown.clone()));
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let workers = WorkerPool::start(runtime.workers, Arc::clone(&queue), Arc::clone(&runner), shutdown.clone());
        let service = Arc::new(JobService::new(queue, runner, verifier));

        let http_listener = TcpListener::bind(runtime.http_addr)
            .await
            .with_context(|| format!("failed to bind {}", runtime.http_addr))?;
        let http_addr = http_listener.local_addr()?;
        let http_task = {
            let service = Arc::clone(&service);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = http::serve(http_listener, service, shutdown).await {
                    error!("HTTP transport stopped: {e:#}");
                }
            })
        };

        let ws_listener = TcpListener::bind(runtime.ws_addr)
            .await
            .with_context(|| format!("failed to bind {}", runtime.ws_addr))?;
        let ws_addr = ws_listener.local_addr()?;
        let socket_task = {
            let service = Arc::clone(&service);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = socket::serve(ws_listener, hub, service, shutdown).await {
                    error!("socket transport stopped: {e:#}");
                }
            })
        };

        let watcher = if runtime.watch_plugins {
            let watched = Arc::new(PluginDirWatcher::new(
                runtime.plugins_dir.clone(),
                Arc::clone(&loader),
                Duration::from_millis(500),
            ));
            match DirectoryWatcher::new(runtime.plugins_dir.clone(), watched, DirectoryWatcher::DEFAULT_POLL, true) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!("plugin hot reload disabled: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        info!(%http_addr, %ws_addr, workers = workers.len(), "chainops host ready");
        Ok(Self {
            loader,
            service,
            workers: Some(workers),
            watcher,
            http_task: Some(http_task),
            socket_task: Some(socket_task),
            http_addr,
            ws_addr,
            shutdown,
            report,
        })
    }

    pub fn service(&self) -> &Arc<JobService> {
        &self.service
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    pub fn discovery(&self) -> &DiscoveryReport {
        &self.report
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Stops accepting work, lets running jobs wind down through their
    /// cancelled tokens, then unloads every plugin.
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        self.shutdown.cancel();
        for task in [self.http_task.take(), self.socket_task.take()].into_iter().flatten() {
            let _ = task.await;
        }
        if let Some(workers) = self.workers.take() {
            workers.join().await;
        }
        self.loader.shutdown().await;
        info!("chainops host stopped");
    }
}
