//! Host side of an out-of-process plugin.
//!
//! [`PluginProcess`] owns the child and speaks newline-delimited JSON-RPC over
//! its stdin/stdout. The capability wrappers below make a remote handler or
//! backend look exactly like an in-process one to the registry and engine.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use command_plugin::capability::{Backend, CommandHandler, CommandLog, ExecutionContext, Runnable, ServicePlugin};
use command_plugin::jsonrpc::{self, Id, Message, Method, Request, Response};
use command_plugin::message::*;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CommandExecutionError, PluginLoadError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What the host needs to answer a plugin's callbacks for one execution.
struct ExecutionBinding {
    backend: Arc<dyn Backend>,
    log: Arc<dyn CommandLog>,
}

pub struct PluginProcess {
    plugin: String,
    tx: mpsc::UnboundedSender<String>,
    inflight: Arc<DashMap<String, oneshot::Sender<Response>>>,
    executions: Arc<DashMap<String, ExecutionBinding>>,
    alive: Arc<AtomicBool>,
    next_id: AtomicI64,
    child: Mutex<Option<Child>>,
}

impl PluginProcess {
    /// Launch `exe_path` as a child process and wire JSON-RPC over its pipes.
    pub fn spawn(exe_path: &Path, plugin: &str) -> Result<Arc<Self>, PluginLoadError> {
        let spawn_err = |source| PluginLoadError::Spawn { path: exe_path.to_path_buf(), source };

        let mut child = TokioCommand::new(exe_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdout unavailable")))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
        let executions: Arc<DashMap<String, ExecutionBinding>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        // rx -> child.stdin
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // child.stdout -> responses | plugin requests
        {
            let inflight = Arc::clone(&inflight);
            let executions = Arc::clone(&executions);
            let alive = Arc::clone(&alive);
            let tx = tx.clone();
            let plugin = plugin.to_string();
            tokio::spawn(async move {
                let mut rdr = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = rdr.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Some((_, waiter)) = inflight.remove(&rsp.id.key()) {
                                let _ = waiter.send(rsp);
                            }
                        }
                        Ok(Message::Request(req)) => {
                            handle_plugin_request(&plugin, &executions, &tx, req);
                        }
                        Err(e) => warn!(%plugin, "ignoring unreadable line from plugin: {e}"),
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // fail every call still waiting on this process
                inflight.clear();
                debug!(%plugin, "plugin stdout closed");
            });
        }

        info!(plugin, path = %exe_path.display(), "plugin process started");
        Ok(Arc::new(Self {
            plugin: plugin.to_string(),
            tx,
            inflight,
            executions,
            alive,
            next_id: AtomicI64::new(1),
            child: Mutex::new(Some(child)),
        }))
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn gone(&self) -> CommandExecutionError {
        CommandExecutionError::PluginGone { plugin: self.plugin.clone() }
    }

    fn send(&self, msg: &impl Serialize) -> Result<(), CommandExecutionError> {
        let line = serde_json::to_string(msg).map_err(|e| CommandExecutionError::Rpc {
            plugin: self.plugin.clone(),
            method: "encode".into(),
            details: e.to_string(),
        })?;
        self.tx.send(format!("{line}\n")).map_err(|_| self.gone())
    }

    /// Sends a request and waits for the matching response.
    pub async fn call(&self, method: Method, params: impl Serialize) -> Result<Value, CommandExecutionError> {
        let params = serde_json::to_value(params).map_err(|e| CommandExecutionError::Rpc {
            plugin: self.plugin.clone(),
            method: method.to_string(),
            details: e.to_string(),
        })?;
        let id = Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = id.key();
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(key.clone(), tx);
        if !self.is_alive() {
            self.inflight.remove(&key);
            return Err(self.gone());
        }
        if let Err(e) = self.send(&Request::call(id, method, Some(params))) {
            self.inflight.remove(&key);
            return Err(e);
        }
        let rsp = rx.await.map_err(|_| self.gone())?;
        rsp.into_result().map_err(|e| CommandExecutionError::Rpc {
            plugin: self.plugin.clone(),
            method: method.to_string(),
            details: e.message,
        })
    }

    /// Like [`call`](Self::call) but decodes the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: Method,
        params: impl Serialize,
    ) -> Result<T, CommandExecutionError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| CommandExecutionError::Rpc {
            plugin: self.plugin.clone(),
            method: method.to_string(),
            details: format!("unexpected result: {e}"),
        })
    }

    pub fn notify(&self, method: Method, params: impl Serialize) {
        let params = serde_json::to_value(params).ok();
        if let Err(e) = self.send(&Request::notification(method, params)) {
            debug!(plugin = %self.plugin, "could not send `{method}`: {e}");
        }
    }

    fn bind_execution(&self, execution_id: &str, backend: Arc<dyn Backend>, log: Arc<dyn CommandLog>) {
        self.executions
            .insert(execution_id.to_string(), ExecutionBinding { backend, log });
    }

    fn unbind_execution(&self, execution_id: &str) {
        self.executions.remove(execution_id);
    }

    /// Asks the plugin to exit, then kills it if it has not within a grace period.
    pub async fn shutdown(&self) {
        self.notify(Method::Shutdown, Value::Null);
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(plugin = %self.plugin, %status, "plugin process exited"),
            Ok(Err(e)) => warn!(plugin = %self.plugin, "waiting for plugin process failed: {e}"),
            Err(_) => {
                warn!(plugin = %self.plugin, "plugin ignored shutdown; killing it");
                if let Err(e) = child.kill().await {
                    error!(plugin = %self.plugin, "could not kill plugin process: {e}");
                }
            }
        }
    }
}

fn params<T: DeserializeOwned>(req: &Request) -> Option<T> {
    req.params.clone().and_then(|v| serde_json::from_value(v).ok())
}

fn reply(tx: &mpsc::UnboundedSender<String>, rsp: &Response) {
    if let Ok(line) = serde_json::to_string(rsp) {
        let _ = tx.send(format!("{line}\n"));
    }
}

/// Answers a request the plugin sent to the host. Log lines are delivered
/// inline to keep their order; backend calls get their own task.
fn handle_plugin_request(
    plugin: &str,
    executions: &Arc<DashMap<String, ExecutionBinding>>,
    tx: &mpsc::UnboundedSender<String>,
    req: Request,
) {
    match req.parsed_method() {
        Some(Method::Log) => {
            let Some(p) = params::<LogParams>(&req) else {
                return;
            };
            match executions.get(&p.execution_id) {
                Some(binding) => binding.log.log(p.level, &p.message),
                None => debug!(plugin, execution = %p.execution_id, "log line after execution ended: {}", p.message),
            }
        }
        Some(Method::InvokeBackend) => {
            let id = req.id.clone().unwrap_or(Id::Null);
            let Some(p) = params::<InvokeBackendParams>(&req) else {
                reply(tx, &Response::fail(id, jsonrpc::INVALID_PARAMS, "Invalid params", None));
                return;
            };
            let Some(backend) = executions.get(&p.execution_id).map(|b| Arc::clone(&b.backend)) else {
                let err = CommandExecutionError::UnknownExecution(p.execution_id);
                reply(tx, &Response::fail(id, jsonrpc::NOT_FOUND, err.to_string(), None));
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let rsp = match backend.invoke(&p.operation, p.args).await {
                    Ok(v) => Response::success(id, v),
                    Err(e) => Response::fail(id, jsonrpc::INTERNAL_ERROR, format!("{e:#}"), None),
                };
                reply(&tx, &rsp);
            });
        }
        _ => {
            error!(plugin, "plugin is asking for a method the host does not serve: {:?}", req.method);
            if let Some(id) = req.id {
                reply(tx, &Response::fail(id, jsonrpc::METHOD_NOT_FOUND, "Method not found", None));
            }
        }
    }
}

/// A handler living in a plugin process.
pub struct RemoteHandler {
    process: Arc<PluginProcess>,
    manifest: CapabilityManifest,
}

impl RemoteHandler {
    pub fn new(process: Arc<PluginProcess>, manifest: CapabilityManifest) -> Self {
        Self { process, manifest }
    }
}

#[async_trait]
impl CommandHandler for RemoteHandler {
    fn command_names(&self) -> Vec<String> {
        self.manifest.command_names.clone()
    }

    fn backend_name(&self) -> String {
        self.manifest.backend_name.clone()
    }

    async fn build(&self, command: &str, payload: &Value) -> anyhow::Result<Box<dyn Runnable>> {
        let params = BuildParams { command: command.to_string(), payload: payload.clone() };
        let built: BuildResult = self.process.call_as(Method::Build, params).await?;
        Ok(Box::new(RemoteRunnable {
            process: Arc::clone(&self.process),
            command: command.to_string(),
            payload: payload.clone(),
            backend: self.manifest.backend_name.clone(),
            requires_previous_completion: built.requires_previous_completion,
        }))
    }

    async fn on_loaded(&self, ctx: &HostContext) -> anyhow::Result<()> {
        self.process.call(Method::OnLoaded, ctx).await?;
        Ok(())
    }
}

pub struct RemoteRunnable {
    process: Arc<PluginProcess>,
    command: String,
    payload: Value,
    backend: String,
    requires_previous_completion: bool,
}

#[async_trait]
impl Runnable for RemoteRunnable {
    fn requires_previous_completion(&self) -> bool {
        self.requires_previous_completion
    }

    async fn execute(&self, backend: Arc<dyn Backend>, ctx: &ExecutionContext) -> CommandOutcome {
        let execution_id = Uuid::new_v4().to_string();
        self.process.bind_execution(&execution_id, backend, Arc::clone(&ctx.log));

        let params = ExecuteParams {
            execution_id: execution_id.clone(),
            command: self.command.clone(),
            payload: self.payload.clone(),
            backend: self.backend.clone(),
        };
        let call = self.process.call(Method::Execute, params);
        tokio::pin!(call);
        let result = tokio::select! {
            result = &mut call => result,
            _ = ctx.cancel.cancelled() => {
                self.process.notify(Method::Cancel, CancelParams { execution_id: execution_id.clone() });
                call.await
            }
        };
        self.process.unbind_execution(&execution_id);

        match result {
            Ok(value) => serde_json::from_value(value)
                .unwrap_or_else(|e| CommandOutcome::failure(format!("plugin returned a malformed outcome: {e}"))),
            Err(e) => CommandOutcome::failure(e.to_string()),
        }
    }
}

/// A backend living in a plugin process.
pub struct RemoteService {
    process: Arc<PluginProcess>,
    name: String,
}

impl RemoteService {
    pub fn new(process: Arc<PluginProcess>, name: impl Into<String>) -> Self {
        Self { process, name: name.into() }
    }
}

#[async_trait]
impl ServicePlugin for RemoteService {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_instance(&self) -> Arc<dyn Backend> {
        Arc::new(RemoteBackend { process: Arc::clone(&self.process) })
    }

    async fn on_loaded(&self, ctx: &HostContext) -> anyhow::Result<()> {
        self.process.call(Method::OnLoaded, ctx).await?;
        Ok(())
    }
}

struct RemoteBackend {
    process: Arc<PluginProcess>,
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn invoke(&self, operation: &str, args: Value) -> anyhow::Result<Value> {
        let params = InvokeParams { operation: operation.to_string(), args };
        Ok(self.process.call(Method::Invoke, params).await?)
    }
}

/// Introspects a freshly started process.
pub async fn describe(process: &PluginProcess) -> Result<DescribeResult, CommandExecutionError> {
    process.call_as(Method::Describe, json!({})).await
}
