//! Supervised worker tasks and the bounded queues that feed them.
//!
//! Workers observe a shared [`CancellationToken`]: once cancelled they stop
//! taking new work, but an item already taken runs to completion.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};

/// Bounded multi-producer, multi-consumer queue.
#[derive(Debug)]
pub struct WorkQueue<T> {
    sender: mpsc::Sender<T>,
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    capacity: usize,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), receiver: self.receiver.clone(), capacity: self.capacity }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum one).
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self { sender, receiver: Arc::new(Mutex::new(receiver)), capacity }
    }

    /// Adds an item without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::QueueFull`] when there is no room, or
    /// [`DeliveryError::ShutdownRequested`] when the queue is closed. The
    /// rejected item is dropped.
    pub fn try_push(&self, item: T) -> Result<()> {
        self.sender.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::ShutdownRequested,
        })
    }

    /// Adds an item, waiting for room until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownRequested`] if cancelled first or the
    /// queue is closed.
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DeliveryError::ShutdownRequested),
            sent = self.sender.send(item) => sent.map_err(|_| DeliveryError::ShutdownRequested),
        }
    }

    /// Takes the next item, or `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            item = async { self.receiver.lock().await.recv().await } => item,
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.sender.capacity()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A named group of supervised tasks sharing one cancellation token.
pub struct WorkerPool {
    name: &'static str,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(name: &'static str, cancel: CancellationToken) -> Self {
        Self { name, cancel, handles: Vec::new() }
    }

    /// Spawns `count` workers built by `make(worker_id)`.
    pub fn spawn_workers<F, Fut>(&mut self, count: usize, make: F)
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for worker_id in 0..count {
            let pool = self.name;
            let work = make(worker_id);
            self.handles.push(tokio::spawn(async move {
                debug!(pool, worker_id, "worker starting");
                work.await;
                debug!(pool, worker_id, "worker stopped");
            }));
        }
        info!(pool = self.name, worker_count = count, "workers spawned");
    }

    /// Adds a single supervised task.
    pub fn spawn_task<Fut>(&mut self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    /// Number of supervised tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool supervises nothing.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether any task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Cancels the pool and waits up to `timeout` for every task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if tasks are still running
    /// when the timeout elapses, or [`DeliveryError::WorkerPanic`] if a task
    /// panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            pool = self.name,
            worker_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful shutdown"
        );
        self.cancel.cancel();

        let handles = std::mem::take(&mut self.handles);
        let name = self.name;
        let join_all = async move {
            let mut panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(pool = name, worker_id, error = %join_error, "worker panicked");
                    panic.get_or_insert(DeliveryError::WorkerPanic { message: join_error.to_string() });
                }
            }
            panic
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => {
                info!(pool = self.name, "shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(pool = self.name, timeout_seconds = timeout.as_secs(), "shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancel.is_cancelled() {
            warn!(
                pool = self.name,
                active_workers = active,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancel.cancel();
        }
    }
}
