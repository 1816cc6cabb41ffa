//! Job admission. Every transport submits, modifies and cancels through
//! [`JobService`]; nothing is scheduled unless admission succeeds.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::AdmissionError;
use crate::job::{CommandChainRequest, JobState, JobStatusRecord, JobStatusStore};
use crate::queue::{JobQueue, JobTicket};
use crate::signature::SignatureVerifier;
use crate::worker::JobRunner;

pub struct JobService {
    queue: Arc<dyn JobQueue>,
    runner: Arc<JobRunner>,
    verifier: SignatureVerifier,
}

impl JobService {
    pub fn new(queue: Arc<dyn JobQueue>, runner: Arc<JobRunner>, verifier: SignatureVerifier) -> Self {
        Self { queue, runner, verifier }
    }

    fn statuses(&self) -> &Arc<JobStatusStore> {
        self.runner.statuses()
    }

    fn admit(&self, request: &CommandChainRequest) -> Result<(), AdmissionError> {
        request.validate()?;
        self.verifier.verify(&request.payload, request.signature.as_deref())?;
        Ok(())
    }

    pub async fn submit(&self, request: CommandChainRequest) -> Result<JobTicket, AdmissionError> {
        if let Err(e) = self.admit(&request) {
            warn!(requested_by = ?request.requested_by, "submission rejected: {e}");
            return Err(e);
        }

        // the callback is registered by whoever takes the job off the queue
        let ticket = match request.every() {
            Some(every) => self.queue.schedule_recurring(request.clone(), every).await,
            None => self.queue.enqueue(request.clone(), request.delay()).await,
        };
        self.statuses().queued(&ticket.id, &request, ticket.enqueued_at);
        info!(
            job_id = %ticket.id,
            commands = request.commands.len(),
            recurring = request.every.is_some(),
            "job admitted"
        );
        Ok(ticket)
    }

    /// Replaces the request of a job that has not started yet.
    pub async fn modify(&self, id: &str, request: CommandChainRequest) -> Result<JobStatusRecord, AdmissionError> {
        self.admit(&request)?;
        if self.queue.replace(id, request.clone()).await {
            self.statuses().replaced(id, &request);
            info!(job_id = %id, "job modified");
            return self.status(id);
        }
        Err(self.not_pending(id))
    }

    /// Removes a pending job, or fires the token of a running one. Returns
    /// the state the job is in afterwards; a running job stays `Running`
    /// until its engine run winds down.
    pub async fn cancel(&self, id: &str) -> Result<JobState, AdmissionError> {
        let removed = self.queue.delete(id).await;
        if self.runner.cancel_running(id) {
            info!(job_id = %id, "cancellation requested for running job");
            return Ok(JobState::Running);
        }
        let Some(request) = removed else {
            return Err(self.not_pending(id));
        };

        info!(job_id = %id, "queued job cancelled");
        let fanout = self.runner.fanout();
        if let Some(callback) = &request.callback_connection_id {
            fanout.callbacks().set(id, callback);
        }
        if let Some(status) = self.statuses().cancelled(id) {
            fanout.publish_result(&status).await;
        }
        fanout.forget(id);
        Ok(JobState::Cancelled)
    }

    pub fn status(&self, id: &str) -> Result<JobStatusRecord, AdmissionError> {
        self.statuses().get(id).ok_or_else(|| AdmissionError::UnknownJob(id.to_string()))
    }

    pub fn logs(&self, id: &str) -> Result<Vec<String>, AdmissionError> {
        if let Some(lines) = self.runner.fanout().store().lines(id) {
            return Ok(lines);
        }
        // known but silent (or evicted) jobs have no lines
        self.status(id).map(|_| Vec::new())
    }

    fn not_pending(&self, id: &str) -> AdmissionError {
        match self.statuses().get(id) {
            None => AdmissionError::UnknownJob(id.to_string()),
            Some(s) if s.status.is_terminal() => AdmissionError::AlreadyFinished(id.to_string()),
            Some(_) => AdmissionError::AlreadyStarted(id.to_string()),
        }
    }
}
