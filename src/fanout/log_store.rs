use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Bounded in-memory log lines keyed by job id.
///
/// Once more than `capacity` distinct jobs have logged, the job that logged
/// first loses its whole history in one step.
pub struct LogStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<String>,
    lines: HashMap<String, Vec<String>>,
}

impl LogStore {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: Mutex::new(Inner::default()) }
    }

    /// Appends a line and returns the ids of any jobs evicted to make room.
    pub fn append(&self, job_id: &str, text: impl Into<String>) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut evicted = Vec::new();
        if !inner.lines.contains_key(job_id) {
            inner.order.push_back(job_id.to_string());
            inner.lines.insert(job_id.to_string(), Vec::new());
            while inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.lines.remove(&oldest);
                    evicted.push(oldest);
                }
            }
        }
        if let Some(lines) = inner.lines.get_mut(job_id) {
            lines.push(text.into());
        }
        evicted
    }

    pub fn lines(&self, job_id: &str) -> Option<Vec<String>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.lines.get(job_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_accumulate_per_job() {
        let store = LogStore::default();
        store.append("a", "one");
        store.append("b", "x");
        store.append("a", "two");
        assert_eq!(store.lines("a").unwrap(), vec!["one", "two"]);
        assert_eq!(store.lines("b").unwrap(), vec!["x"]);
        assert!(store.lines("c").is_none());
    }

    #[test]
    fn the_101st_job_evicts_the_oldest_whole() {
        let store = LogStore::new(100);
        for i in 0..100 {
            store.append(&format!("job-{i}"), "first");
            store.append(&format!("job-{i}"), "second");
        }
        assert_eq!(store.job_count(), 100);

        // more lines for an old job do not refresh its position
        assert!(store.append("job-0", "third").is_empty());

        let evicted = store.append("job-100", "hello");
        assert_eq!(evicted, vec!["job-0".to_string()]);
        assert_eq!(store.job_count(), 100);
        assert!(store.lines("job-0").is_none());
        assert_eq!(store.lines("job-1").unwrap().len(), 2);
    }
}
