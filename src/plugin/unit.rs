//! Isolation units and the leases that keep them alive while in use.
//!
//! A unit is closed before its names leave the registry, so no new lease can be
//! taken once unloading has begun. Unloading then waits for the outstanding
//! leases to be released before the plugin process is terminated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use super::remote::PluginProcess;

pub struct IsolationUnit {
    id: Uuid,
    plugin: String,
    in_flight: AtomicUsize,
    closing: AtomicBool,
    drained: Notify,
    process: Option<Arc<PluginProcess>>,
}

impl IsolationUnit {
    /// A unit backed by a plugin process.
    pub fn remote(id: Uuid, plugin: impl Into<String>, process: Arc<PluginProcess>) -> Arc<Self> {
        Arc::new(Self::with_process(id, plugin.into(), Some(process)))
    }

    /// A unit for a capability living inside the host.
    pub fn in_process(plugin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_process(Uuid::new_v4(), plugin.into(), None))
    }

    fn with_process(id: Uuid, plugin: String, process: Option<Arc<PluginProcess>>) -> Self {
        Self {
            id,
            plugin,
            in_flight: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            drained: Notify::new(),
            process,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Takes a lease, or `None` once the unit is closing.
    pub fn enter(self: &Arc<Self>) -> Option<UnitLease> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closing.load(Ordering::SeqCst) {
            self.release();
            return None;
        }
        Some(UnitLease { unit: Arc::clone(self) })
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once no lease is outstanding.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            debug!(unit = %self.id, in_flight = self.in_flight(), "waiting for in-flight calls to drain");
            notified.await;
        }
    }

    /// Closes the unit, waits for it to drain and stops its process.
    pub async fn terminate(&self) {
        self.close();
        self.drain().await;
        if let Some(process) = &self.process {
            process.shutdown().await;
        }
    }
}

impl std::fmt::Debug for IsolationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationUnit")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("in_flight", &self.in_flight())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Keeps a unit from finishing its unload while held.
pub struct UnitLease {
    unit: Arc<IsolationUnit>,
}

impl UnitLease {
    pub fn unit_id(&self) -> Uuid {
        self.unit.id
    }
}

impl Drop for UnitLease {
    fn drop(&mut self) {
        self.unit.release();
    }
}
