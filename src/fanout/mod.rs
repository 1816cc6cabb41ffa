//! Result & Log Fan-out.
//!
//! Each job gets a [`JobLogger`] that tees every line to `tracing`, the
//! bounded [`LogStore`] and the registered log publishers. Finished jobs are
//! handed to the result publishers. Publisher failures are logged and
//! dropped; they never fail a job.

mod job_logger;
mod log_store;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

pub use job_logger::JobLogger;
pub use log_store::LogStore;

use crate::error::TransportDeliveryError;
use crate::job::JobStatusRecord;

#[async_trait]
pub trait LogPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish_log(
        &self,
        callback_id: Option<&str>,
        job_id: &str,
        line: &str,
    ) -> Result<(), TransportDeliveryError>;
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish_result(
        &self,
        callback_id: Option<&str>,
        result: &JobStatusRecord,
    ) -> Result<(), TransportDeliveryError>;
}

/// job id -> callback id. Set when a job leaves the queue, removed once its
/// result has been published.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: DashMap<String, String>,
}

impl CallbackRegistry {
    pub fn set(&self, job_id: &str, callback_id: &str) {
        self.callbacks.insert(job_id.to_string(), callback_id.to_string());
    }

    pub fn get(&self, job_id: &str) -> Option<String> {
        self.callbacks.get(job_id).map(|c| c.clone())
    }

    pub fn remove(&self, job_id: &str) {
        self.callbacks.remove(job_id);
    }
}

pub struct Fanout {
    store: Arc<LogStore>,
    callbacks: Arc<CallbackRegistry>,
    log_publishers: Arc<Vec<Arc<dyn LogPublisher>>>,
    result_publishers: Vec<Arc<dyn ResultPublisher>>,
}

impl Fanout {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self {
            store,
            callbacks: Arc::new(CallbackRegistry::default()),
            log_publishers: Arc::new(Vec::new()),
            result_publishers: Vec::new(),
        }
    }

    pub fn with_log_publisher(mut self, publisher: Arc<dyn LogPublisher>) -> Self {
        Arc::make_mut(&mut self.log_publishers).push(publisher);
        self
    }

    pub fn with_result_publisher(mut self, publisher: Arc<dyn ResultPublisher>) -> Self {
        self.result_publishers.push(publisher);
        self
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn job_logger(&self, job_id: &str) -> JobLogger {
        JobLogger::new(
            job_id,
            Arc::clone(&self.store),
            Arc::clone(&self.callbacks),
            Arc::clone(&self.log_publishers),
        )
    }

    /// Drops the callback of a job that will not run again.
    pub fn forget(&self, job_id: &str) {
        self.callbacks.remove(job_id);
    }

    pub async fn publish_result(&self, result: &JobStatusRecord) {
        let callback = self.callbacks.get(&result.id);
        for publisher in &self.result_publishers {
            if let Err(e) = publisher.publish_result(callback.as_deref(), result).await {
                warn!(job_id = %result.id, publisher = publisher.name(), "result not delivered: {e}");
            }
        }
    }
}
