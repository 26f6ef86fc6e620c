//! Bounded worker pools for start tasks.
//!
//! Each host runs two independent pools so registry-triggered on-demand
//! starts never queue behind phase startup. Concurrency is bounded by a
//! semaphore, queue depth by a pending counter; a saturated queue rejects
//! new tasks instead of growing without bound.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::types::{Error, Result};

/// Bounded task pool.
pub struct TaskPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl TaskPool {
    /// `workers` concurrent tasks, at most `max_pending` waiting for a slot.
    pub fn new(name: &'static str, workers: usize, max_pending: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
        }
    }

    /// Schedule a task. It runs once a worker slot frees up.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queued = self.pending.fetch_add(1, Ordering::SeqCst);
        if queued >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::exhausted(format!(
                "{} pool queue full ({} pending)",
                self.name, queued
            )));
        }

        let permits = self.permits.clone();
        let pending = self.pending.clone();
        Ok(tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            pending.fetch_sub(1, Ordering::SeqCst);
            match permit {
                Ok(_permit) => fut.await,
                // Semaphore closed: pool shut down before the task ran.
                Err(_) => {}
            }
        }))
    }

    /// Tasks scheduled but not yet running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Refuse further work; queued tasks that have not acquired a slot are
    /// dropped.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Resolve a configured worker count; 0 means available parallelism.
pub fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
