use std::sync::Arc;

use command_plugin::capability::CommandLog;
use command_plugin::message::{CommandOutcome, LogLevel};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::engine::{ChainEngine, ProgressSink};
use crate::fanout::Fanout;
use crate::job::{JobState, JobStatusRecord, JobStatusStore};
use crate::logger::JOB_REPORT_TARGET;
use crate::queue::{JobQueue, QueuedJob};

struct JobProgress {
    job_id: String,
    statuses: Arc<JobStatusStore>,
}

impl ProgressSink for JobProgress {
    fn command_finished(&self, index: usize, outcome: &CommandOutcome) {
        self.statuses.record_outcome(&self.job_id, index, outcome);
    }
}

/// Runs one dequeued job end to end and tracks the ones in flight so they
/// can be cancelled.
pub struct JobRunner {
    engine: ChainEngine,
    statuses: Arc<JobStatusStore>,
    fanout: Arc<Fanout>,
    running: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        engine: ChainEngine,
        statuses: Arc<JobStatusStore>,
        fanout: Arc<Fanout>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { engine, statuses, fanout, running: DashMap::new(), shutdown }
    }

    pub fn statuses(&self) -> &Arc<JobStatusStore> {
        &self.statuses
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    /// Fires the token of a running job. The job still finishes through the
    /// normal path and reports its cancelled outcomes.
    pub fn cancel_running(&self, job_id: &str) -> bool {
        match self.running.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn run_job(&self, job: QueuedJob) -> Option<JobStatusRecord> {
        let QueuedJob { id, request, every } = job;
        let cancel = self.shutdown.child_token();
        self.running.insert(id.clone(), cancel.clone());
        self.statuses.started(&id, &request);
        if let Some(callback) = &request.callback_connection_id {
            self.fanout.callbacks().set(&id, callback);
        }

        let logger = Arc::new(self.fanout.job_logger(&id));
        logger.log(
            LogLevel::Info,
            &format!("starting chain [{}]", request.commands.join(", ")),
        );

        let progress = Arc::new(JobProgress { job_id: id.clone(), statuses: Arc::clone(&self.statuses) });
        let record = self
            .engine
            .run(
                &id,
                &request.commands,
                &request.payload,
                cancel,
                Arc::clone(&logger) as Arc<dyn CommandLog>,
                progress,
            )
            .await;
        self.running.remove(&id);

        logger.log(LogLevel::Info, &format!("chain finished: {}", record.state));
        logger.close().await;
        info!(
            target: JOB_REPORT_TARGET,
            job_id = %id,
            state = %record.state,
            commands = record.commands.len(),
            failed = record.outcomes.iter().filter(|o| !o.is_success()).count(),
            "job finished"
        );

        let status = self.statuses.finished(&record);
        if let Some(status) = &status {
            self.fanout.publish_result(status).await;
        }
        if every.is_none() || record.state == JobState::Cancelled {
            self.fanout.forget(&id);
        }
        status
    }
}

/// Fixed set of workers pulling from one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        queue: Arc<dyn JobQueue>,
        runner: Arc<JobRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|n| {
                let queue = Arc::clone(&queue);
                let runner = Arc::clone(&runner);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move {
                        debug!("worker started");
                        while let Some(job) = queue.dequeue(&shutdown).await {
                            let job_id = job.id.clone();
                            info!(%job_id, "job dequeued");
                            runner.run_job(job).await;
                        }
                        debug!("worker stopped");
                    }
                    .instrument(info_span!("worker", n)),
                )
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to finish its current job and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
