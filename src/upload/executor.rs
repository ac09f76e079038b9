//! Caller-runs executor
//!
//! A fixed pool of long-lived worker tasks. A submitted task is handed to an
//! idle worker when one exists; otherwise the submitter runs it inline. Nothing
//! is ever queued behind a busy worker, so at most `pool_size + 1` tasks run at
//! once and the producer cannot outrun the workers.

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// Executor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor already closed")]
    Closed,
}

/// Unit of work accepted by the executor.
pub type Task = BoxFuture<'static, ()>;

struct Job {
    task: Task,
    // released once the worker finishes the task, marking it idle again
    _idle: OwnedSemaphorePermit,
}

/// Executor with a caller-runs overflow policy.
pub struct CallerRunsExecutor {
    pool_size: usize,
    idle: Arc<Semaphore>,
    sender: Option<mpsc::UnboundedSender<Job>>,
    receiver: Option<mpsc::UnboundedReceiver<Job>>,
    workers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for CallerRunsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerRunsExecutor")
            .field("pool_size", &self.pool_size)
            .field("idle", &self.idle.available_permits())
            .field("started", &!self.workers.is_empty())
            .field("closed", &self.closed)
            .finish()
    }
}

impl CallerRunsExecutor {
    /// Create an executor backed by `pool_size` workers.
    ///
    /// With a pool size of zero every task runs on the caller. Workers are
    /// spawned on the first hand-off, so construction does not need a runtime.
    pub fn new(pool_size: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            pool_size,
            idle: Arc::new(Semaphore::new(pool_size)),
            sender: Some(sender),
            receiver: Some(receiver),
            workers: Vec::with_capacity(pool_size),
            closed: false,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Execute `task`, either on an idle worker or inline on the caller.
    ///
    /// The error only reports whether the task could be submitted; the task's
    /// own outcome is its business.
    pub async fn execute(&mut self, task: Task) -> Result<(), ExecutorError> {
        if self.closed {
            return Err(ExecutorError::Closed);
        }

        let permit = match Arc::clone(&self.idle).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                task.await;
                return Ok(());
            }
            Err(TryAcquireError::Closed) => return Err(ExecutorError::Closed),
        };

        self.start_workers();

        let sender = self.sender.as_ref().ok_or(ExecutorError::Closed)?;
        sender
            .send(Job {
                task,
                _idle: permit,
            })
            .map_err(|_| ExecutorError::Closed)
    }

    fn start_workers(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };

        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..self.pool_size {
            let receiver = Arc::clone(&receiver);
            self.workers.push(tokio::spawn(async move {
                loop {
                    // hold the lock only while waiting for the next job
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    job.task.await;
                }
                tracing::trace!(worker_id = worker_id, "Executor worker stopped");
            }));
        }
    }

    /// Stop accepting tasks and wait for the workers to drain and exit.
    pub async fn shutdown(&mut self) -> Result<(), ExecutorError> {
        if self.closed {
            return Err(ExecutorError::Closed);
        }

        self.closed = true;
        self.idle.close();
        self.sender.take();
        self.receiver.take();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Executor worker terminated abnormally");
            }
        }

        Ok(())
    }

    /// Like [`shutdown`](Self::shutdown), but stopping twice is a no-op.
    pub async fn stop(&mut self) {
        match self.shutdown().await {
            Ok(()) | Err(ExecutorError::Closed) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_zero_pool_runs_inline() {
        let mut executor = CallerRunsExecutor::new(0);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        executor
            .execute(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await
            .unwrap();

        // completed before execute returned
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runs_inline_when_workers_busy() {
        let mut executor = CallerRunsExecutor::new(1);
        let release = Arc::new(Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));

        // occupies the only worker until released
        let gate = Arc::clone(&release);
        executor
            .execute(
                async move {
                    gate.notified().await;
                }
                .boxed(),
            )
            .await
            .unwrap();

        let counter = Arc::clone(&ran);
        executor
            .execute(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        release.notify_one();
        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let mut executor = CallerRunsExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            executor
                .execute(
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    }
                    .boxed(),
                )
                .await
                .unwrap();
        }

        executor.shutdown().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_workers() {
        let mut executor = CallerRunsExecutor::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&ran);
            executor
                .execute(
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed(),
                )
                .await
                .unwrap();
        }

        executor.shutdown().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_fails() {
        let mut executor = CallerRunsExecutor::new(1);
        executor.shutdown().await.unwrap();

        let result = executor.execute(async {}.boxed()).await;
        assert_eq!(result, Err(ExecutorError::Closed));
        assert_eq!(executor.shutdown().await, Err(ExecutorError::Closed));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut executor = CallerRunsExecutor::new(2);
        executor.execute(async {}.boxed()).await.unwrap();

        executor.stop().await;
        executor.stop().await;
        assert!(executor.is_closed());
    }
}
