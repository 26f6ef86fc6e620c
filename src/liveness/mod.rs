//! Liveness subsystem - death-notification plumbing.
//!
//! Both the registry and the service host observe remote handles through a
//! `DeathWatch`: "observe liveness of handle X, run this cleanup on loss."
//! Subscriptions are cancellable when the holder no longer cares (a record
//! is overwritten or explicitly removed). Cleanup callbacks run on their own
//! task and must snapshot state before mutating, never compare against live
//! collections from inside the callback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::remote::RemoteHandle;

/// Identifier of one death-observation subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Tracks death-observation tasks and allows cancelling them.
#[derive(Debug, Default)]
pub struct DeathWatch {
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl DeathWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe `handle`; when it dies, run `on_death` once.
    ///
    /// Must be called from within a tokio runtime. If the handle is already
    /// dead the callback fires immediately on the spawned task.
    pub fn observe<F, Fut>(&self, handle: &RemoteHandle, on_death: F) -> WatchId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = handle.death_signal();
        let token = handle.token();
        let task = tokio::spawn(async move {
            signal.cancelled().await;
            tracing::debug!("remote endpoint {} died, running cleanup", token);
            on_death().await;
        });
        self.tasks.lock().insert(id, task);
        WatchId(id)
    }

    /// Stop observing. Safe to call for already-fired or unknown watches.
    pub fn cancel(&self, id: WatchId) {
        if let Some(task) = self.tasks.lock().remove(&id.0) {
            task.abort();
        }
    }

    /// Number of registered (possibly already fired) subscriptions.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Abort every outstanding observation (process teardown).
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}

impl Drop for DeathWatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_once_on_death() {
        let watch = DeathWatch::new();
        let handle = RemoteHandle::new("svc:1");
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        watch.observe(&handle, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_watch_never_fires() {
        let watch = DeathWatch::new();
        let handle = RemoteHandle::new("svc:2");
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let id = watch.observe(&handle, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        watch.cancel(id);
        handle.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watch.is_empty());
    }

    #[tokio::test]
    async fn observing_dead_handle_fires_immediately() {
        let watch = DeathWatch::new();
        let handle = RemoteHandle::new("svc:3");
        handle.kill();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watch.observe(&handle, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
