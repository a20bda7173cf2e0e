//! Bounded pool for delayed background jobs.
//!
//! A fixed number of worker tasks pull jobs off a shared unbounded queue, so
//! `submit` never waits and at most `workers` jobs run at once. Shutdown closes
//! the queue, lets the workers drain it for a grace period, then cancels
//! whatever is still running and discards whatever is still queued.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task pool is shutting down; rejected {0}")]
    ShuttingDown(String),
}

/// A named job plus the callback that consumes its result. The callback only
/// runs if the job completes; a cancelled job reports nothing.
pub struct BackgroundTask {
    name: String,
    job: BoxFuture<'static, ()>,
}

impl BackgroundTask {
    pub fn new<W, T, C>(name: impl Into<String>, work: W, on_complete: C) -> Self
    where
        W: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        Self {
            name: name.into(),
            job: Box::pin(async move { on_complete(work.await) }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every queued and running task finished inside the grace period.
    pub drained: bool,
    /// Tasks that were running when the grace period ran out.
    pub cancelled: usize,
    /// Tasks that never started.
    pub discarded: usize,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
}

pub struct TaskPool {
    queue: Mutex<Option<flume::Sender<BackgroundTask>>>,
    backlog: flume::Receiver<BackgroundTask>,
    workers: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl TaskPool {
    /// Spawns `workers` worker tasks on the current tokio runtime.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let mut handles = JoinSet::new();
        for index in 0..workers {
            handles.spawn(run_worker(
                index,
                rx.clone(),
                cancel.clone(),
                Arc::clone(&counters),
            ));
        }

        Self {
            queue: Mutex::new(Some(tx)),
            backlog: rx,
            workers: Mutex::new(handles),
            cancel,
            counters,
        }
    }

    pub fn submit(&self, task: BackgroundTask) -> Result<(), SubmitError> {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(SubmitError::ShuttingDown(task.name));
        };
        debug!(task = %task.name, queued = tx.len(), "background task submitted");
        tx.send(task)
            .map_err(|flume::SendError(task)| SubmitError::ShuttingDown(task.name))
    }

    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.backlog.len()
    }

    pub fn completed(&self) -> usize {
        self.counters.completed.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Stops accepting work and waits up to `grace` for the queue to drain.
    /// Anything left after that is cancelled. Calling it again is a no-op.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let Some(queue) = self.queue.lock().take() else {
            return ShutdownReport {
                drained: true,
                ..ShutdownReport::default()
            };
        };
        drop(queue);
        let mut workers = std::mem::take(&mut *self.workers.lock());

        info!(
            running = self.running(),
            queued = self.queued(),
            grace_ms = grace.as_millis() as u64,
            "task pool shutting down"
        );

        // `join_next` is cancel-safe: workers reaped before the timeout are
        // gone from the set and never awaited again.
        let drained = tokio::time::timeout(grace, join_workers(&mut workers))
            .await
            .is_ok();
        if drained {
            return ShutdownReport {
                drained,
                ..ShutdownReport::default()
            };
        }

        self.cancel.cancel();
        join_workers(&mut workers).await;
        let discarded = self.backlog.drain().count();
        let cancelled = self.counters.cancelled.load(Ordering::Acquire);
        warn!(cancelled, discarded, "task pool grace period expired");

        ShutdownReport {
            drained,
            cancelled,
            discarded,
        }
    }
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(error) = result {
            warn!(?error, "task pool worker ended abnormally");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    index: usize,
    queue: flume::Receiver<BackgroundTask>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let task = select! {
            biased;
            _ = cancel.cancelled() => break,
            task = queue.recv_async() => match task {
                Ok(task) => task,
                Err(flume::RecvError::Disconnected) => break,
            },
        };

        let BackgroundTask { name, job } = task;
        counters.running.fetch_add(1, Ordering::AcqRel);
        debug!(worker = index, task = %name, "background task started");
        let finished = select! {
            biased;
            _ = cancel.cancelled() => false,
            () = job => true,
        };
        counters.running.fetch_sub(1, Ordering::AcqRel);

        if finished {
            counters.completed.fetch_add(1, Ordering::AcqRel);
            debug!(worker = index, task = %name, "background task finished");
        } else {
            counters.cancelled.fetch_add(1, Ordering::AcqRel);
            warn!(worker = index, task = %name, "background task cancelled");
            break;
        }
    }
    debug!(worker = index, "task pool worker stopped");
}
