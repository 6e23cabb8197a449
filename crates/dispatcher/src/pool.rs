//! WorkerPool - runs P independent workers and stops them within a grace period

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use observability::metrics as obs;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PoolError;

/// Handed to the worker factory
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub id: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// How one worker ended
#[derive(Debug)]
pub struct WorkerExit<T> {
    pub id: usize,
    /// `Err` carries the panic message
    pub result: Result<T, String>,
}

/// Result of [`WorkerPool::stop`]
#[derive(Debug)]
pub struct StopReport<T> {
    pub finished: Vec<WorkerExit<T>>,
    /// Workers still running when the grace period ran out
    pub abandoned: Vec<usize>,
}

impl<T> StopReport<T> {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Counts down once per worker
#[derive(Debug)]
struct CompletionLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionLatch {
    fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent count_down is not missed
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Signals the latch when the worker task ends, panicking or not
struct LatchGuard(Arc<CompletionLatch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

struct WorkerHandle {
    id: usize,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Fixed-size pool of worker tasks
pub struct WorkerPool<T> {
    parallelism: usize,
    grace: Duration,
    state: PoolState,
    handles: Vec<WorkerHandle>,
    latch: Arc<CompletionLatch>,
    exits: Arc<Mutex<Vec<WorkerExit<T>>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `parallelism` below 1 is raised to 1
    pub fn new(parallelism: usize, grace: Duration) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            parallelism,
            grace,
            state: PoolState::Idle,
            handles: Vec::with_capacity(parallelism),
            latch: Arc::new(CompletionLatch::new(parallelism)),
            exits: Arc::new(Mutex::new(Vec::with_capacity(parallelism))),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Workers that have not finished yet
    pub fn running(&self) -> usize {
        self.latch.remaining()
    }

    /// Spawn one task per worker
    ///
    /// `factory` is called once per worker id, in order.
    #[instrument(name = "worker_pool_start", skip(self, factory), fields(parallelism = self.parallelism))]
    pub fn start<F, Fut>(&mut self, mut factory: F) -> Result<(), PoolError>
    where
        F: FnMut(WorkerContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.state != PoolState::Idle {
            return Err(PoolError::AlreadyStarted);
        }

        for id in 0..self.parallelism {
            let cancel = CancellationToken::new();
            let worker = factory(WorkerContext {
                id,
                cancel: cancel.clone(),
            });

            let guard = LatchGuard(Arc::clone(&self.latch));
            let exits = Arc::clone(&self.exits);

            let join = tokio::spawn(async move {
                let _guard = guard;
                obs::record_worker_event(id, "started");

                let result = AssertUnwindSafe(worker)
                    .catch_unwind()
                    .await
                    .map_err(panic_message);

                match &result {
                    Ok(_) => {
                        debug!(worker = id, "Worker finished");
                        obs::record_worker_event(id, "finished");
                    }
                    Err(message) => {
                        error!(worker = id, panic = %message, "Worker panicked");
                        obs::record_worker_event(id, "panicked");
                    }
                }

                exits.lock().push(WorkerExit { id, result });
            });

            self.handles.push(WorkerHandle { id, cancel, join });
        }

        self.state = PoolState::Running;
        info!(parallelism = self.parallelism, "Worker pool started");
        Ok(())
    }

    /// Wait until every worker has finished on its own
    #[instrument(name = "worker_pool_await", skip(self))]
    pub async fn await_completion(&mut self) -> Result<Vec<WorkerExit<T>>, PoolError> {
        if self.state == PoolState::Idle {
            return Err(PoolError::NotStarted);
        }

        self.latch.wait().await;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.join.await {
                error!(worker = handle.id, error = %e, "Worker task failed");
            }
        }

        self.state = PoolState::Stopped;
        info!("Worker pool completed");
        Ok(self.take_exits())
    }

    /// Cancel every worker and wait at most the grace period
    ///
    /// Workers still running afterwards are reported as abandoned; their
    /// tasks keep running detached.
    #[instrument(name = "worker_pool_stop", skip(self), fields(grace_ms = self.grace.as_millis() as u64))]
    pub async fn stop(&mut self) -> Result<StopReport<T>, PoolError> {
        match self.state {
            PoolState::Idle => return Err(PoolError::NotStarted),
            PoolState::Stopped => {
                return Ok(StopReport {
                    finished: self.take_exits(),
                    abandoned: Vec::new(),
                })
            }
            PoolState::Running | PoolState::Stopping => {}
        }

        self.state = PoolState::Stopping;
        info!(running = self.running(), "Stopping worker pool");
        for handle in &self.handles {
            handle.cancel.cancel();
        }

        if tokio::time::timeout(self.grace, self.latch.wait()).await.is_err() {
            warn!(running = self.running(), "Grace period elapsed");
        }

        let finished = self.take_exits();
        let abandoned: Vec<usize> = self
            .handles
            .drain(..)
            .filter(|handle| !finished.iter().any(|exit| exit.id == handle.id))
            .map(|handle| handle.id)
            .collect();

        for id in &abandoned {
            error!(worker = id, "Worker did not stop within grace period, abandoned");
            obs::record_worker_event(*id, "abandoned");
        }

        self.state = PoolState::Stopped;
        info!(
            finished = finished.len(),
            abandoned = abandoned.len(),
            "Worker pool stopped"
        );
        Ok(StopReport {
            finished,
            abandoned,
        })
    }

    fn take_exits(&self) -> Vec<WorkerExit<T>> {
        let mut exits = std::mem::take(&mut *self.exits.lock());
        exits.sort_by_key(|exit| exit.id);
        exits
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
