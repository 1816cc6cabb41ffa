//! Test plugin executable. What it exports depends on the name it is
//! installed under:
//!
//! * `*backend`   - a backend named after the file, with `echo`, `sleep` and `fail`
//! * `*ambiguous` - a handler and a backend at once (rejected by the loader)
//! * `*unready`   - a handler whose `onLoaded` always fails
//! * anything else - a handler for `<name>.step` and `<name>.echo` bound to `mock-backend`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use command_plugin::payload::decode_section;
use command_plugin::plugin_runtime::{init_plugin_tracing, run};
use command_plugin::{Backend, Capability, CommandHandler, CommandOutcome, ExecutionContext, HostContext, Runnable, ServicePlugin};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

const BACKEND: &str = "mock-backend";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Step {
    sleep_ms: u64,
    wait_for_previous: bool,
    fail: bool,
    message: Option<String>,
}

struct StepRun {
    command: String,
    step: Step,
}

#[async_trait]
impl Runnable for StepRun {
    fn requires_previous_completion(&self) -> bool {
        self.step.wait_for_previous
    }

    async fn execute(&self, backend: Arc<dyn Backend>, ctx: &ExecutionContext) -> CommandOutcome {
        ctx.info(&format!("{} started", self.command));
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.step.sleep_ms)) => {}
            _ = ctx.cancel.cancelled() => {
                ctx.warn(&format!("{} cancelled", self.command));
                return CommandOutcome::cancelled();
            }
        }
        if self.step.fail {
            return CommandOutcome::failure(format!("{} failed on request", self.command));
        }
        let args = json!({"command": self.command, "message": self.step.message});
        match backend.invoke("echo", args).await {
            Ok(v) => {
                ctx.info(&format!("{} done", self.command));
                CommandOutcome::success(Some(v))
            }
            Err(e) => CommandOutcome::failure(format!("{e:#}")),
        }
    }
}

struct StepHandler {
    prefix: String,
    unready: bool,
}

#[async_trait]
impl CommandHandler for StepHandler {
    fn command_names(&self) -> Vec<String> {
        vec![format!("{}.step", self.prefix), format!("{}.echo", self.prefix)]
    }

    fn backend_name(&self) -> String {
        BACKEND.to_string()
    }

    async fn build(&self, command: &str, payload: &Value) -> Result<Box<dyn Runnable>> {
        Ok(Box::new(StepRun { command: command.to_string(), step: decode_section(payload, command) }))
    }

    async fn on_loaded(&self, ctx: &HostContext) -> Result<()> {
        if self.unready {
            bail!("{} refuses to start", ctx.plugin_name);
        }
        info!(unit = %ctx.unit_id, settings = ctx.config.len(), "handler ready");
        Ok(())
    }
}

struct Echo {
    name: String,
}

#[async_trait]
impl Backend for Echo {
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value> {
        match operation {
            "echo" => Ok(json!({"backend": self.name, "args": args})),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"slept": ms}))
            }
            "fail" => Err(anyhow!("backend failure requested")),
            other => Err(anyhow!("unknown operation `{other}`")),
        }
    }
}

struct EchoService {
    name: String,
}

#[async_trait]
impl ServicePlugin for EchoService {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_instance(&self) -> Arc<dyn Backend> {
        Arc::new(Echo { name: self.name.clone() })
    }
}

fn exports(stem: &str) -> Vec<Capability> {
    let handler = |unready| {
        Capability::handler(stem, Arc::new(StepHandler { prefix: stem.to_string(), unready }))
    };
    let backend = || Capability::backend(Arc::new(EchoService { name: stem.to_string() }));

    if stem.ends_with("backend") {
        vec![backend()]
    } else if stem.ends_with("ambiguous") {
        vec![handler(false), backend()]
    } else if stem.ends_with("unready") {
        vec![handler(true)]
    } else {
        vec![handler(false)]
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_plugin_tracing("info");
    let exe = std::env::current_exe()?;
    let stem = exe
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("executable has no file name"))?;
    run(exports(&stem)).await
}
