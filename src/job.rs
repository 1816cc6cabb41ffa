use chrono::{DateTime, Utc};
use command_plugin::message::CommandOutcome;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::AdmissionError;

/// What a caller submits. Immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommandChainRequest {
    pub commands: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds to wait before the job becomes runnable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Milliseconds between runs of a recurring job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl CommandChainRequest {
    pub fn new(commands: impl IntoIterator<Item = impl Into<String>>, payload: Value) -> Self {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            payload,
            ..Default::default()
        }
    }

    pub fn from_json(value: Value) -> Result<Self, AdmissionError> {
        let request: Self = serde_json::from_value(value).map_err(|e| AdmissionError::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        if let Some(blank) = self.commands.iter().position(|c| c.trim().is_empty()) {
            return Err(AdmissionError::Malformed(format!("command at index {blank} is blank")));
        }
        if self.every == Some(0) {
            return Err(AdmissionError::Malformed("`every` must be positive".into()));
        }
        Ok(())
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay.map(Duration::from_millis)
    }

    pub fn every(&self) -> Option<Duration> {
        self.every.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of one engine run. Outcomes are in command order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionRecord {
    pub job_id: String,
    pub commands: Vec<String>,
    pub outcomes: Vec<CommandOutcome>,
    pub state: JobState,
}

impl JobExecutionRecord {
    pub fn new(job_id: &str, commands: &[String], outcomes: Vec<CommandOutcome>, cancelled: bool) -> Self {
        let state = if cancelled && outcomes.iter().any(CommandOutcome::is_cancelled) {
            JobState::Cancelled
        } else if outcomes.iter().all(CommandOutcome::is_success) {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        Self { job_id: job_id.to_string(), commands: commands.to_vec(), outcomes, state }
    }
}

/// What the status endpoint returns: state plus whatever outcomes exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusRecord {
    pub id: String,
    pub status: JobState,
    pub commands: Vec<String>,
    /// One slot per command; `None` until that command has finished.
    pub outcomes: Vec<Option<CommandOutcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Latest known status of every admitted job.
#[derive(Default)]
pub struct JobStatusStore {
    jobs: DashMap<String, JobStatusRecord>,
}

impl JobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(id: &str, request: &CommandChainRequest, enqueued_at: DateTime<Utc>) -> JobStatusRecord {
        JobStatusRecord {
            id: id.to_string(),
            status: JobState::Queued,
            commands: request.commands.clone(),
            outcomes: vec![None; request.commands.len()],
            requested_by: request.requested_by.clone(),
            enqueued_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Records an admitted job. A worker may already have picked it up, in
    /// which case the existing record wins.
    pub fn queued(&self, id: &str, request: &CommandChainRequest, enqueued_at: DateTime<Utc>) {
        self.jobs
            .entry(id.to_string())
            .or_insert_with(|| Self::fresh(id, request, enqueued_at));
    }

    /// Resets the record for a (re)run of `request`.
    pub fn started(&self, id: &str, request: &CommandChainRequest) {
        let now = Utc::now();
        let mut entry = self
            .jobs
            .entry(id.to_string())
            .or_insert_with(|| Self::fresh(id, request, now));
        entry.status = JobState::Running;
        entry.commands = request.commands.clone();
        entry.outcomes = vec![None; request.commands.len()];
        entry.requested_by = request.requested_by.clone();
        entry.started_at = Some(now);
        entry.finished_at = None;
    }

    pub fn record_outcome(&self, id: &str, index: usize, outcome: &CommandOutcome) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            if let Some(slot) = entry.outcomes.get_mut(index) {
                *slot = Some(outcome.clone());
            }
        }
    }

    pub fn finished(&self, record: &JobExecutionRecord) -> Option<JobStatusRecord> {
        let mut entry = self.jobs.get_mut(&record.job_id)?;
        entry.status = record.state;
        entry.outcomes = record.outcomes.iter().cloned().map(Some).collect();
        entry.finished_at = Some(Utc::now());
        Some(entry.clone())
    }

    pub fn cancelled(&self, id: &str) -> Option<JobStatusRecord> {
        let mut entry = self.jobs.get_mut(id)?;
        entry.status = JobState::Cancelled;
        entry.finished_at = Some(Utc::now());
        Some(entry.clone())
    }

    pub fn replaced(&self, id: &str, request: &CommandChainRequest) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.commands = request.commands.clone();
            entry.outcomes = vec![None; request.commands.len()];
            entry.requested_by = request.requested_by.clone();
        }
    }

    pub fn get(&self, id: &str) -> Option<JobStatusRecord> {
        self.jobs.get(id).map(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_reads_camel_case_and_defaults() {
        let req = CommandChainRequest::from_json(json!({
            "commands": ["ldap.lookup", "vm.create"],
            "payload": {"user": "jdoe"},
            "callbackConnectionId": "conn-1",
            "delay": 500
        }))
        .unwrap();
        assert_eq!(req.commands.len(), 2);
        assert_eq!(req.callback_connection_id.as_deref(), Some("conn-1"));
        assert_eq!(req.delay(), Some(Duration::from_millis(500)));
        assert!(req.signature.is_none());
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(matches!(
            CommandChainRequest::from_json(json!({"payload": {}})),
            Err(AdmissionError::Malformed(_))
        ));
        assert!(matches!(
            CommandChainRequest::from_json(json!({"commands": ["a", " "]})),
            Err(AdmissionError::Malformed(_))
        ));
        assert!(matches!(
            CommandChainRequest::from_json(json!({"commands": "a"})),
            Err(AdmissionError::Malformed(_))
        ));
    }

    #[test]
    fn record_state_follows_outcomes() {
        let cmds = vec!["a".to_string(), "b".to_string()];
        let ok = JobExecutionRecord::new("j", &cmds, vec![CommandOutcome::success(None); 2], false);
        assert_eq!(ok.state, JobState::Succeeded);

        let failed = JobExecutionRecord::new(
            "j",
            &cmds,
            vec![CommandOutcome::success(None), CommandOutcome::failure("boom")],
            false,
        );
        assert_eq!(failed.state, JobState::Failed);

        let cancelled = JobExecutionRecord::new(
            "j",
            &cmds,
            vec![CommandOutcome::success(None), CommandOutcome::cancelled()],
            true,
        );
        assert_eq!(cancelled.state, JobState::Cancelled);

        let empty = JobExecutionRecord::new("j", &[], vec![], false);
        assert_eq!(empty.state, JobState::Succeeded);
    }

    #[test]
    fn status_store_keeps_partial_outcomes() {
        let store = JobStatusStore::new();
        let req = CommandChainRequest::new(["a", "b"], json!({}));
        store.queued("j1", &req, Utc::now());
        store.started("j1", &req);
        store.record_outcome("j1", 1, &CommandOutcome::failure("nope"));

        let status = store.get("j1").unwrap();
        assert_eq!(status.status, JobState::Running);
        assert_eq!(status.outcomes[0], None);
        assert_eq!(status.outcomes[1].as_ref().unwrap().status, "nope");
    }
}
