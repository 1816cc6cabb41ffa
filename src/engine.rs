//! Chain Execution Engine.
//!
//! One left-to-right pass over the chain. Every command is built, then
//! spawned at once; a command whose runnable asks for the previous entry to
//! complete first is spawned as a continuation of that entry's handle. Only
//! these adjacent links impose ordering, so the chain takes as long as its
//! longest run of linked entries.
//!
//! Consecutive waiting entries chain transitively. A dependent starts after
//! its predecessor completes whether or not it succeeded. Once the chain's
//! token is cancelled, a dependent whose predecessor has not completed never
//! starts and records a cancelled outcome.

use std::sync::Arc;

use command_plugin::capability::{CommandLog, ExecutionContext};
use command_plugin::message::{CommandOutcome, LogLevel};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::dispatch::{Dispatcher, PreparedCommand};
use crate::job::JobExecutionRecord;

type ExecutionHandle = Shared<BoxFuture<'static, CommandOutcome>>;

/// Told about each command as it finishes, in completion order.
pub trait ProgressSink: Send + Sync {
    fn command_finished(&self, index: usize, outcome: &CommandOutcome);
}

impl ProgressSink for () {
    fn command_finished(&self, _index: usize, _outcome: &CommandOutcome) {}
}

#[derive(Clone)]
pub struct ChainEngine {
    dispatcher: Dispatcher,
}

impl ChainEngine {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn run(
        &self,
        job_id: &str,
        commands: &[String],
        payload: &Value,
        cancel: CancellationToken,
        log: Arc<dyn CommandLog>,
        progress: Arc<dyn ProgressSink>,
    ) -> JobExecutionRecord {
        let mut handles: Vec<ExecutionHandle> = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            let ctx = ExecutionContext::new(cancel.clone(), Arc::clone(&log));
            let execution: BoxFuture<'static, CommandOutcome> = match self.dispatcher.build(command, payload).await {
                Ok(prepared) => {
                    let previous = if prepared.requires_previous_completion() {
                        handles.last().cloned()
                    } else {
                        None
                    };
                    run_prepared(prepared, previous, ctx).boxed()
                }
                Err(e) => {
                    log.log(LogLevel::Error, &format!("{command}: {e}"));
                    let outcome = CommandOutcome::failure(e.to_string());
                    async move { outcome }.boxed()
                }
            };

            let span = info_span!("command", job_id, index, command = %command);
            let progress = Arc::clone(&progress);
            let task = tokio::spawn(
                async move {
                    let outcome = execution.await;
                    debug!(status = %outcome.status, "command finished");
                    progress.command_finished(index, &outcome);
                    outcome
                }
                .instrument(span),
            );
            let handle = async move {
                task.await
                    .unwrap_or_else(|e| CommandOutcome::failure(format!("command task failed: {e}")))
            }
            .boxed()
            .shared();
            handles.push(handle);
        }

        let outcomes = join_all(handles).await;
        JobExecutionRecord::new(job_id, commands, outcomes, cancel.is_cancelled())
    }
}

async fn run_prepared(
    prepared: PreparedCommand,
    previous: Option<ExecutionHandle>,
    ctx: ExecutionContext,
) -> CommandOutcome {
    if let Some(previous) = previous {
        // a predecessor that already finished wins over a later cancel
        tokio::select! {
            biased;
            _ = previous => {}
            _ = ctx.cancel.cancelled() => return CommandOutcome::cancelled(),
        }
    }
    prepared.runnable.execute(Arc::clone(&prepared.backend), &ctx).await
}
