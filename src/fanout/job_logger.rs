use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use command_plugin::capability::CommandLog;
use command_plugin::message::LogLevel;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CallbackRegistry, LogPublisher, LogStore};

struct Delivery {
    callback: Option<String>,
    line: String,
}

/// Per-job log tee. Publisher delivery runs on one task per job so lines
/// arrive in the order they were written.
pub struct JobLogger {
    job_id: String,
    store: Arc<LogStore>,
    callbacks: Arc<CallbackRegistry>,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl JobLogger {
    pub(super) fn new(
        job_id: &str,
        store: Arc<LogStore>,
        callbacks: Arc<CallbackRegistry>,
        publishers: Arc<Vec<Arc<dyn LogPublisher>>>,
    ) -> Self {
        let (tx, delivery) = if publishers.is_empty() {
            (None, None)
        } else {
            let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
            let job = job_id.to_string();
            let handle = tokio::spawn(async move {
                while let Some(d) = rx.recv().await {
                    for publisher in publishers.iter() {
                        if let Err(e) = publisher.publish_log(d.callback.as_deref(), &job, &d.line).await {
                            warn!(job_id = %job, publisher = publisher.name(), "log line not delivered: {e}");
                        }
                    }
                }
            });
            (Some(tx), Some(handle))
        };

        Self {
            job_id: job_id.to_string(),
            store,
            callbacks,
            tx: Mutex::new(tx),
            delivery: Mutex::new(delivery),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Waits until every line written so far has been offered to the
    /// publishers. Lines written afterwards only reach tracing and the store.
    pub async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.delivery.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn level_tag(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "TRACE",
        LogLevel::Debug => "DEBUG",
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
        LogLevel::Critical => "CRITICAL",
    }
}

impl CommandLog for JobLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let job_id = self.job_id.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(job_id, "{message}"),
            LogLevel::Debug => tracing::debug!(job_id, "{message}"),
            LogLevel::Info => tracing::info!(job_id, "{message}"),
            LogLevel::Warn => tracing::warn!(job_id, "{message}"),
            LogLevel::Error => tracing::error!(job_id, "{message}"),
            LogLevel::Critical => tracing::error!(job_id, "[CRITICAL] {message}"),
        }

        let line = format!(
            "{} [{}] {message}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level_tag(level)
        );
        for evicted in self.store.append(&self.job_id, line.clone()) {
            debug!(job_id = %evicted, "log history evicted");
        }

        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(Delivery { callback: self.callbacks.get(&self.job_id), line });
        }
    }
}
