//! In-memory stand-in for the durable job queue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::CommandChainRequest;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobTicket {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub request: CommandChainRequest,
    /// Set for jobs that run again after every `every`.
    pub every: Option<Duration>,
}

/// The primitives a durable queue offers. At-least-once delivery and
/// persistence are the implementation's concern.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: CommandChainRequest, delay: Option<Duration>) -> JobTicket;

    /// Swaps the request of a job that has not been handed out yet.
    async fn replace(&self, id: &str, job: CommandChainRequest) -> bool;

    /// Removes a job that has not been handed out yet, or stops a recurring
    /// one. Returns the request that was removed.
    async fn delete(&self, id: &str) -> Option<CommandChainRequest>;

    async fn schedule_recurring(&self, job: CommandChainRequest, every: Duration) -> JobTicket;

    /// Waits for the next due job; `None` once `cancel` fires.
    async fn dequeue(&self, cancel: &CancellationToken) -> Option<QueuedJob>;
}

struct Entry {
    request: CommandChainRequest,
    due: Instant,
    every: Option<Duration>,
    seq: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    seq: u64,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    changed: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, request: CommandChainRequest, delay: Duration, every: Option<Duration>) -> JobTicket {
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.seq += 1;
            let seq = state.seq;
            state.entries.insert(id.clone(), Entry { request, due: Instant::now() + delay, every, seq });
        }
        self.changed.notify_waiters();
        JobTicket { id, enqueued_at: Utc::now() }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands out the earliest due job, or says how long until the next one.
    fn take_due(&self) -> Result<QueuedJob, Option<Duration>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let next = state
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.due, e.seq))
            .map(|(id, e)| (id.clone(), e.due));
        let Some((id, due)) = next else {
            return Err(None);
        };
        if due > now {
            return Err(Some(due - now));
        }

        let recurring = state.entries.get(&id).and_then(|e| e.every);
        let job = match recurring {
            Some(every) => {
                state.seq += 1;
                let seq = state.seq;
                let Some(entry) = state.entries.get_mut(&id) else {
                    return Err(None);
                };
                entry.due = now + every;
                entry.seq = seq;
                QueuedJob { id, request: entry.request.clone(), every: Some(every) }
            }
            None => {
                let Some(entry) = state.entries.remove(&id) else {
                    return Err(None);
                };
                QueuedJob { id, request: entry.request, every: None }
            }
        };
        Ok(job)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: CommandChainRequest, delay: Option<Duration>) -> JobTicket {
        self.insert(job, delay.unwrap_or_default(), None)
    }

    async fn replace(&self, id: &str, job: CommandChainRequest) -> bool {
        let replaced = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.entries.get_mut(id) {
                Some(entry) => {
                    if let Some(delay) = job.delay() {
                        entry.due = Instant::now() + delay;
                    }
                    entry.request = job;
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.changed.notify_waiters();
        }
        replaced
    }

    async fn delete(&self, id: &str) -> Option<CommandChainRequest> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.remove(id).map(|entry| entry.request)
    }

    async fn schedule_recurring(&self, job: CommandChainRequest, every: Duration) -> JobTicket {
        let first = job.delay().unwrap_or_default();
        self.insert(job, first, Some(every))
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Option<QueuedJob> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let wait = match self.take_due() {
                Ok(job) => return Some(job),
                Err(wait) => wait,
            };

            match wait {
                Some(wait) => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut changed => {}
                    _ = tokio::time::sleep(wait) => {}
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut changed => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(name: &str) -> CommandChainRequest {
        CommandChainRequest::new([name], json!({}))
    }

    #[tokio::test]
    async fn jobs_come_out_in_due_order() {
        let queue = InMemoryJobQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(req("late"), Some(Duration::from_millis(80))).await;
        queue.enqueue(req("now"), None).await;

        assert_eq!(queue.dequeue(&cancel).await.unwrap().request.commands, vec!["now"]);
        let started = Instant::now();
        assert_eq!(queue.dequeue(&cancel).await.unwrap().request.commands, vec!["late"]);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(req("a"), None).await;
        let job = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn delete_and_replace_only_touch_pending_jobs() {
        let queue = InMemoryJobQueue::new();
        let ticket = queue.enqueue(req("a"), Some(Duration::from_secs(60))).await;
        assert!(queue.replace(&ticket.id, req("b")).await);
        assert_eq!(queue.delete(&ticket.id).await.map(|r| r.commands), Some(vec!["b".to_string()]));
        assert!(queue.delete(&ticket.id).await.is_none());
        assert!(!queue.replace(&ticket.id, req("c")).await);
    }

    #[tokio::test]
    async fn recurring_job_is_rearmed() {
        let queue = InMemoryJobQueue::new();
        let cancel = CancellationToken::new();
        let ticket = queue.schedule_recurring(req("tick"), Duration::from_millis(30)).await;

        let first = queue.dequeue(&cancel).await.unwrap();
        let second = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(first.id, ticket.id);
        assert_eq!(second.id, ticket.id);
        assert_eq!(queue.len(), 1);

        assert!(queue.delete(&ticket.id).await.is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_a_waiting_dequeue() {
        let queue = InMemoryJobQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_none());
    }
}
