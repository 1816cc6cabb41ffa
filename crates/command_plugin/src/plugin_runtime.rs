//! Async runtime that wires **stdin / stdout** JSON‑RPC traffic to the
//! capabilities a plugin executable exports.
//!
//! * Requests from the host are handled concurrently, one task each.
//! * `cancel` and `shutdown` notifications are handled inline.
//! * Handlers reach their backend through the host (`invokeBackend`) and
//!   write job log lines back with `log` notifications.
//!
//! Usage:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     command_plugin::plugin_runtime::init_plugin_tracing("info");
//!     command_plugin::plugin_runtime::run(vec![Capability::backend(Arc::new(MyDirectory))]).await
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use crate::capability::{Backend, Capability, CommandLog, ExecutionContext};
use crate::jsonrpc::{self, Id, Message, Method, Request, Response};
use crate::message::*;

/// Plugin-side logging goes to stderr; stdout belongs to the RPC channel.
pub fn init_plugin_tracing(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

struct RuntimeState {
    exports: Vec<Capability>,
    out: mpsc::UnboundedSender<String>,
    pending: DashMap<String, oneshot::Sender<Response>>,
    executions: DashMap<String, CancellationToken>,
    next_id: AtomicI64,
}

impl RuntimeState {
    fn send(&self, msg: &impl Serialize) {
        match serde_json::to_string(msg) {
            Ok(line) => {
                let _ = self.out.send(format!("{line}\n"));
            }
            Err(e) => error!("could not serialise outgoing message: {e}"),
        }
    }

    async fn call_host(&self, method: Method, params: Value) -> Result<Value> {
        let id = Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.key(), tx);
        self.send(&Request::call(id, method, Some(params)));
        let rsp = rx.await.map_err(|_| anyhow!("host went away during `{method}`"))?;
        rsp.into_result().map_err(|e| anyhow!(e.message))
    }
}

/// Proxy handed to a handler: its backend lives on the host side.
struct HostBackend {
    state: Arc<RuntimeState>,
    execution_id: String,
}

#[async_trait]
impl Backend for HostBackend {
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value> {
        let params = InvokeBackendParams {
            execution_id: self.execution_id.clone(),
            operation: operation.to_string(),
            args,
        };
        self.state.call_host(Method::InvokeBackend, serde_json::to_value(params)?).await
    }
}

struct HostLog {
    state: Arc<RuntimeState>,
    execution_id: String,
}

impl CommandLog for HostLog {
    fn log(&self, level: LogLevel, message: &str) {
        debug!(execution_id = %self.execution_id, "{message}");
        let params = LogParams {
            execution_id: self.execution_id.clone(),
            level,
            message: message.to_string(),
        };
        if let Ok(v) = serde_json::to_value(params) {
            self.state.send(&Request::notification(Method::Log, Some(v)));
        }
    }
}

/// Runs the JSON‑RPC stdin/stdout loop until EOF, `shutdown` or a fatal error.
pub async fn run(exports: Vec<Capability>) -> Result<()> {
    run_with_io(exports, io::stdin(), io::stdout()).await
}

/// Same as [`run`] over arbitrary pipes.
pub async fn run_with_io<R, W>(exports: Vec<Capability>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(output);
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                eprintln!("stdout write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                eprintln!("stdout flush error");
                break;
            }
        }
    });

    let state = Arc::new(RuntimeState {
        exports,
        out: tx,
        pending: DashMap::new(),
        executions: DashMap::new(),
        next_id: AtomicI64::new(1),
    });

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Response(rsp)) => {
                if let Some((_, waiter)) = state.pending.remove(&rsp.id.key()) {
                    let _ = waiter.send(rsp);
                }
            }
            Ok(Message::Request(req)) => match req.parsed_method() {
                Some(Method::Shutdown) => break,
                Some(Method::Cancel) => {
                    if let Some(p) = params::<CancelParams>(&req) {
                        if let Some(token) = state.executions.get(&p.execution_id) {
                            token.cancel();
                        }
                    }
                }
                method => {
                    // register before spawning so a cancel read right after is not lost
                    if method == Some(Method::Execute) {
                        if let Some(p) = params::<ExecuteParams>(&req) {
                            state.executions.entry(p.execution_id).or_insert_with(CancellationToken::new);
                        }
                    }
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let id = req.id.clone();
                        let rsp = handle_request(&state, req).await;
                        if let (Some(id), Some(rsp)) = (id, rsp) {
                            state.send(&Response { id, ..rsp });
                        }
                    });
                }
            },
            Err(e) => {
                state.send(&Response::fail(Id::Null, jsonrpc::PARSE_ERROR, "Parse error", Some(json!(e.to_string()))));
            }
        }
    }

    for entry in state.executions.iter() {
        entry.value().cancel();
    }
    // unblock handlers still waiting on the host
    state.pending.clear();
    // dropping the last sender lets the writer drain and exit
    drop(state);
    let _ = writer.await;
    Ok(())
}

fn params<T: DeserializeOwned>(req: &Request) -> Option<T> {
    req.params.clone().and_then(|v| serde_json::from_value(v).ok())
}

fn ok(result: impl Serialize) -> Option<Response> {
    match serde_json::to_value(result) {
        Ok(v) => Some(Response::success(Id::Null, v)),
        Err(e) => Some(Response::fail(Id::Null, jsonrpc::INTERNAL_ERROR, e.to_string(), None)),
    }
}

fn fail(code: i64, message: impl Into<String>) -> Option<Response> {
    Some(Response::fail(Id::Null, code, message, None))
}

/// Produces the response body; the caller stamps the request id on it.
async fn handle_request(state: &Arc<RuntimeState>, req: Request) -> Option<Response> {
    match req.parsed_method() {
        Some(Method::Describe) => ok(DescribeResult {
            capabilities: state.exports.iter().map(Capability::manifest).collect(),
        }),

        Some(Method::OnLoaded) => {
            let Some(ctx) = params::<HostContext>(&req) else {
                return fail(jsonrpc::INVALID_PARAMS, "Invalid params");
            };
            for export in &state.exports {
                if let Err(e) = export.on_loaded(&ctx).await {
                    return fail(jsonrpc::INTERNAL_ERROR, format!("onLoaded failed: {e:#}"));
                }
            }
            ok(Value::Null)
        }

        Some(Method::Build) => {
            let Some(p) = params::<BuildParams>(&req) else {
                return fail(jsonrpc::INVALID_PARAMS, "Invalid params");
            };
            let Some(handler) = find_handler(state, &p.command) else {
                return fail(jsonrpc::NOT_FOUND, format!("command `{}` is not exported here", p.command));
            };
            match handler.build(&p.command, &p.payload).await {
                Ok(runnable) => ok(BuildResult {
                    requires_previous_completion: runnable.requires_previous_completion(),
                }),
                Err(e) => fail(jsonrpc::INTERNAL_ERROR, format!("{e:#}")),
            }
        }

        Some(Method::Execute) => {
            let Some(p) = params::<ExecuteParams>(&req) else {
                return fail(jsonrpc::INVALID_PARAMS, "Invalid params");
            };
            let token = state
                .executions
                .entry(p.execution_id.clone())
                .or_insert_with(CancellationToken::new)
                .clone();
            let rsp = execute(state, &p, token).await;
            state.executions.remove(&p.execution_id);
            rsp
        }

        Some(Method::Invoke) => {
            let Some(p) = params::<InvokeParams>(&req) else {
                return fail(jsonrpc::INVALID_PARAMS, "Invalid params");
            };
            let Some(service) = state.exports.iter().find_map(|c| match c {
                Capability::Backend(s) => Some(Arc::clone(s)),
                _ => None,
            }) else {
                return fail(jsonrpc::NOT_FOUND, "no backend is exported here");
            };
            match service.get_instance().invoke(&p.operation, p.args).await {
                Ok(v) => ok(v),
                Err(e) => fail(jsonrpc::INTERNAL_ERROR, format!("{e:#}")),
            }
        }

        _ => {
            warn!("host asked for a method this plugin does not serve: {:?}", req.method);
            fail(jsonrpc::METHOD_NOT_FOUND, "Method not found")
        }
    }
}

async fn execute(state: &Arc<RuntimeState>, p: &ExecuteParams, token: CancellationToken) -> Option<Response> {
    let Some(handler) = find_handler(state, &p.command) else {
        return fail(jsonrpc::NOT_FOUND, format!("command `{}` is not exported here", p.command));
    };
    let runnable = match handler.build(&p.command, &p.payload).await {
        Ok(runnable) => runnable,
        Err(e) => return ok(CommandOutcome::failure(format!("{e:#}"))),
    };
    if token.is_cancelled() {
        return ok(CommandOutcome::cancelled());
    }
    let backend = Arc::new(HostBackend {
        state: Arc::clone(state),
        execution_id: p.execution_id.clone(),
    });
    let log = Arc::new(HostLog {
        state: Arc::clone(state),
        execution_id: p.execution_id.clone(),
    });
    let ctx = ExecutionContext::new(token, log);
    ok(runnable.execute(backend, &ctx).await)
}

fn find_handler(state: &RuntimeState, command: &str) -> Option<Arc<dyn crate::capability::CommandHandler>> {
    state.exports.iter().find_map(|c| match c {
        Capability::Handler { handler, .. } if handler.command_names().iter().any(|n| n == command) => {
            Some(Arc::clone(handler))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CommandHandler, Runnable, ServicePlugin};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    struct Upper;

    #[async_trait]
    impl Backend for Upper {
        async fn invoke(&self, operation: &str, args: Value) -> Result<Value> {
            match operation {
                "upper" => Ok(json!(args.as_str().unwrap_or_default().to_uppercase())),
                other => Err(anyhow!("unknown operation {other}")),
            }
        }
    }

    struct UpperService;

    #[async_trait]
    impl ServicePlugin for UpperService {
        fn name(&self) -> String {
            "upper".into()
        }
        fn get_instance(&self) -> Arc<dyn Backend> {
            Arc::new(Upper)
        }
    }

    struct Shout {
        wait: bool,
    }

    #[async_trait]
    impl Runnable for Shout {
        fn requires_previous_completion(&self) -> bool {
            self.wait
        }
        async fn execute(&self, backend: Arc<dyn Backend>, ctx: &ExecutionContext) -> CommandOutcome {
            ctx.info("shouting");
            match backend.invoke("upper", json!("hi")).await {
                Ok(v) => CommandOutcome::success(Some(v)),
                Err(e) => CommandOutcome::failure(e.to_string()),
            }
        }
    }

    struct ShoutHandler;

    #[async_trait]
    impl CommandHandler for ShoutHandler {
        fn command_names(&self) -> Vec<String> {
            vec!["shout".into()]
        }
        fn backend_name(&self) -> String {
            "upper".into()
        }
        async fn build(&self, _command: &str, payload: &Value) -> Result<Box<dyn Runnable>> {
            Ok(Box::new(Shout { wait: payload.get("wait").and_then(Value::as_bool).unwrap_or(false) }))
        }
    }

    async fn roundtrip(exports: Vec<Capability>, req: Request) -> Response {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_in, plugin_out) = tokio::io::split(plugin_side);
        tokio::spawn(run_with_io(exports, plugin_in, plugin_out));

        let (host_in, mut host_out) = tokio::io::split(host_side);
        let line = serde_json::to_string(&req).unwrap();
        host_out.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut lines = BufReader::new(host_in).lines();
        loop {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Response(rsp) = serde_json::from_str::<Message>(&line).unwrap() {
                return rsp;
            }
        }
    }

    #[tokio::test]
    async fn describe_lists_every_export() {
        let exports = vec![
            Capability::handler("shouter", Arc::new(ShoutHandler)),
            Capability::backend(Arc::new(UpperService)),
        ];
        let rsp = roundtrip(exports, Request::call(Id::Number(1), Method::Describe, None)).await;
        assert_eq!(rsp.id, Id::Number(1));
        let described: DescribeResult = serde_json::from_value(rsp.into_result().unwrap()).unwrap();
        assert_eq!(described.capabilities.len(), 2);
        assert_eq!(described.capabilities[0].command_names, vec!["shout".to_string()]);
    }

    #[tokio::test]
    async fn build_reports_the_wait_flag() {
        let exports = vec![Capability::handler("shouter", Arc::new(ShoutHandler))];
        let req = Request::call(Id::Number(2), Method::Build, Some(json!({"command": "shout", "payload": {"wait": true}})));
        let rsp = roundtrip(exports, req).await;
        let built: BuildResult = serde_json::from_value(rsp.into_result().unwrap()).unwrap();
        assert!(built.requires_previous_completion);
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let exports = vec![Capability::handler("shouter", Arc::new(ShoutHandler))];
        let req = Request::call(Id::Number(3), Method::Build, Some(json!({"command": "whisper"})));
        let err = roundtrip(exports, req).await.into_result().unwrap_err();
        assert_eq!(err.code, jsonrpc::NOT_FOUND);
    }

    #[tokio::test]
    async fn invoke_reaches_the_backend() {
        let exports = vec![Capability::backend(Arc::new(UpperService))];
        let req = Request::call(Id::Number(4), Method::Invoke, Some(json!({"operation": "upper", "args": "abc"})));
        let v = roundtrip(exports, req).await.into_result().unwrap();
        assert_eq!(v, json!("ABC"));
    }

    #[tokio::test]
    async fn execute_calls_back_into_the_host_for_its_backend() {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_in, plugin_out) = tokio::io::split(plugin_side);
        tokio::spawn(run_with_io(vec![Capability::handler("shouter", Arc::new(ShoutHandler))], plugin_in, plugin_out));

        let (host_in, mut host_out) = tokio::io::split(host_side);
        let exec = Request::call(
            Id::Number(9),
            Method::Execute,
            Some(json!({"executionId": "e1", "command": "shout", "payload": {}, "backend": "upper"})),
        );
        host_out.write_all(format!("{}\n", serde_json::to_string(&exec).unwrap()).as_bytes()).await.unwrap();

        let mut lines = BufReader::new(host_in).lines();
        let mut saw_log = false;
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            match serde_json::from_str::<Message>(&line).unwrap() {
                Message::Request(req) if req.method == "log" => saw_log = true,
                Message::Request(req) if req.method == "invokeBackend" => {
                    let rsp = Response::success(req.id.unwrap(), json!("HI"));
                    host_out.write_all(format!("{}\n", serde_json::to_string(&rsp).unwrap()).as_bytes()).await.unwrap();
                }
                Message::Response(rsp) => {
                    let outcome: CommandOutcome = serde_json::from_value(rsp.into_result().unwrap()).unwrap();
                    assert!(outcome.is_success());
                    assert_eq!(outcome.payload, Some(json!("HI")));
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(saw_log);
    }

    struct Patient;

    #[async_trait]
    impl Runnable for Patient {
        fn requires_previous_completion(&self) -> bool {
            false
        }
        async fn execute(&self, _backend: Arc<dyn Backend>, ctx: &ExecutionContext) -> CommandOutcome {
            tokio::select! {
                _ = ctx.cancel.cancelled() => CommandOutcome::cancelled(),
                _ = tokio::time::sleep(Duration::from_secs(5)) => CommandOutcome::success(None),
            }
        }
    }

    struct SlowBuild;

    #[async_trait]
    impl CommandHandler for SlowBuild {
        fn command_names(&self) -> Vec<String> {
            vec!["provision".into()]
        }
        fn backend_name(&self) -> String {
            "hypervisor".into()
        }
        async fn build(&self, _command: &str, _payload: &Value) -> Result<Box<dyn Runnable>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Box::new(Patient))
        }
    }

    #[tokio::test]
    async fn cancel_arriving_while_the_command_builds_is_honoured() {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_in, plugin_out) = tokio::io::split(plugin_side);
        tokio::spawn(run_with_io(vec![Capability::handler("slow", Arc::new(SlowBuild))], plugin_in, plugin_out));

        let (host_in, mut host_out) = tokio::io::split(host_side);
        let exec = Request::call(
            Id::Number(11),
            Method::Execute,
            Some(json!({"executionId": "e2", "command": "provision", "payload": {}, "backend": "hypervisor"})),
        );
        let cancel = Request::notification(Method::Cancel, Some(json!({"executionId": "e2"})));
        let frame = format!(
            "{}\n{}\n",
            serde_json::to_string(&exec).unwrap(),
            serde_json::to_string(&cancel).unwrap()
        );
        host_out.write_all(frame.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(host_in).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("execute was not answered after cancel")
            .unwrap()
            .unwrap();
        let Message::Response(rsp) = serde_json::from_str::<Message>(&line).unwrap() else {
            panic!("expected a response, got {line}");
        };
        let outcome: CommandOutcome = serde_json::from_value(rsp.into_result().unwrap()).unwrap();
        assert!(outcome.is_cancelled(), "{outcome:?}");
    }
}
