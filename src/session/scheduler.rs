// Deferred task scheduling for the SFU
//
// This module runs keyed, delayed tasks such as the disconnect grace check.
// Scheduling under a key that already has a pending task replaces that task.
// A task that has started running is no longer pending and cannot be
// replaced or cancelled through its key.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Pending task under one key
struct Pending {
    generation: u64,
    handle: AbortHandle,
}

/// Keyed scheduler of delayed tasks, owned by whoever needs the timers
pub struct TaskScheduler {
    name: String,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

impl TaskScheduler {
    /// Create a scheduler; `name` only shows up in logs
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Run `task` after `delay` under `key`, replacing a pending task with
    /// the same key
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            tracing::debug!(scheduler = %self.name, "Scheduler closed, task dropped");
            return;
        }

        let key = key.into();
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.child_token();
        let task_key = key.clone();

        // the lock is held until the entry is in place, so the task never
        // looks for its entry before it exists
        let mut entries = self.pending.lock();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut entries = pending.lock();
                match entries.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&task_key);
                    }
                    _ => return,
                }
            }
            task.await;
        })
        .abort_handle();

        if let Some(previous) = entries.insert(key.clone(), Pending { generation, handle }) {
            previous.handle.abort();
            tracing::debug!(scheduler = %self.name, key = %key, "Replaced pending task");
        }
    }

    /// Cancel the pending task under `key`; false if there was none
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task is pending under `key`
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel everything and refuse new tasks
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        for (_, entry) in self.pending.lock().drain() {
            entry.handle.abort();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);
        let make = move || {
            let count = Arc::clone(&task_count);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let scheduler = TaskScheduler::new("test");
        let (count, make) = counter();
        scheduler.schedule("a", Duration::from_secs(10), make());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_task() {
        let scheduler = TaskScheduler::new("test");
        let (count, make) = counter();
        scheduler.schedule("a", Duration::from_secs(10), make());
        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.schedule("a", Duration::from_secs(10), make());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_cancel_all() {
        let scheduler = TaskScheduler::new("test");
        let (count, make) = counter();
        scheduler.schedule("a", Duration::from_secs(1), make());
        scheduler.schedule("b", Duration::from_secs(1), make());

        assert!(scheduler.cancel("a"));
        assert!(!scheduler.cancel("a"));
        scheduler.cancel_all();
        scheduler.schedule("c", Duration::from_secs(1), make());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_empty());
    }
}
