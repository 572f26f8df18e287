//! TaskQueue / Task: a generic event-loop abstraction that runs a
//! user-supplied unit of work against a single socket, cooperatively
//! interleaved with every other task the same queue currently owns.
//!
//! A raw `poll(2)` loop over each task's socket FD would be one way to
//! drive this; this crate is built on `tokio`, whose reactor already *is*
//! that poll loop, so a [`TaskQueue`] reproduces the higher-level contract
//! on top of it instead of re-implementing poll by hand: one `tokio` task
//! per queue owns a `FuturesUnordered` of in-flight request futures, the
//! async equivalent of a single thread multiplexing many fds. Concurrency
//! within a queue is accordingly bounded: many tasks make progress on one
//! queue "thread" at a time, never across queues.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A process-wide monotonically increasing counter, used both for task IDs
/// and temp-file selection: kept sequentially unique across the whole
/// process rather than per-server.
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed) as u64
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A handle a producer holds onto a still-running or already-finished task.
/// Dropping it neither cancels nor detaches the task — use [`TaskHandle::cancel`]
/// or [`TaskHandle::wait`] explicitly; task memory is freed exactly once
/// by whichever path applies.
pub struct TaskHandle<T> {
    id: u64,
    cancel: CancellationToken,
    result: oneshot::Receiver<std::result::Result<T, Error>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sets the cancel flag and signals the owning queue; delivered to the
    /// running future as a cancelled [`std::future::Future`] via the
    /// `CancellationToken` it was given, which is expected to resolve with
    /// `Error::Config`-free cancellation state on its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the task reaches a terminal state or `timeout` elapses.
    /// Mirrors the original's `OK | TIMEOUT | ERROR` three-way wait result.
    pub async fn wait(self, timeout: std::time::Duration) -> WaitOutcome<T> {
        match tokio::time::timeout(timeout, self.result).await {
            Ok(Ok(Ok(v))) => WaitOutcome::Ok(v),
            Ok(Ok(Err(e))) => WaitOutcome::Error(e),
            Ok(Err(_)) => WaitOutcome::Error(Error::exhaustion("task dropped before completion")),
            Err(_) => WaitOutcome::Timeout,
        }
    }
}

#[derive(Debug)]
pub enum WaitOutcome<T> {
    Ok(T),
    Timeout,
    Error(Error),
}

/// One worker "thread": a single-concurrency-domain driver that advances
/// every task it currently owns on each iteration, the way the original's
/// poll loop advances every fd whose readiness fired.
pub struct TaskQueue {
    new_tasks: mpsc::UnboundedSender<BoxFuture<()>>,
    running: Arc<AtomicUsize>,
}

impl TaskQueue {
    fn spawn_worker() -> (mpsc::UnboundedSender<BoxFuture<()>>, Arc<AtomicUsize>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<()>>();
        let running = Arc::new(AtomicUsize::new(0));
        let running_for_worker = running.clone();
        tokio::spawn(async move {
            let mut inflight: FuturesUnordered<BoxFuture<()>> = FuturesUnordered::new();
            loop {
                tokio::select! {
                    biased;
                    maybe_task = rx.recv() => {
                        match maybe_task {
                            Some(fut) => inflight.push(fut),
                            // Sender side (the TaskQueue) was dropped: drain
                            // what's left, then exit.
                            None => {
                                while inflight.next().await.is_some() {}
                                break;
                            }
                        }
                    }
                    Some(()) = inflight.next(), if !inflight.is_empty() => {
                        running_for_worker.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
        });
        (tx, running)
    }

    pub fn new() -> Self {
        let (new_tasks, running) = Self::spawn_worker();
        Self { new_tasks, running }
    }

    /// Current running-task count, used by [`TaskQueuePool`]'s
    /// shortest-queue tie-break.
    pub fn len(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueues `work`, returning a handle the caller can cancel or wait
    /// on. `work` receives a [`CancellationToken`] it must observe at its
    /// await points (typically via `tokio::select!` against socket I/O).
    pub fn enqueue<T, F, Fut>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, Error>> + Send + 'static,
    {
        let id = next_id();
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let (result_tx, result_rx) = oneshot::channel();
        self.running.fetch_add(1, Ordering::AcqRel);
        let boxed: BoxFuture<()> = Box::pin(async move {
            let outcome = work(cancel_for_task).await;
            let _ = result_tx.send(outcome);
        });
        // An unbounded channel whose receiver only exits once the sender is
        // dropped never fails to send.
        let _ = self.new_tasks.send(boxed);
        TaskHandle {
            id,
            cancel,
            result: result_rx,
        }
    }

    /// Runs `work` to completion on this queue, as though enqueued, and
    /// blocks the caller until it finishes: enqueue plus an immediate
    /// wait, reusing the same shared queue rather than a disposable
    /// one-slot queue, since `tokio` tasks are cheap enough that a
    /// dedicated queue buys nothing extra.
    pub async fn run_sync<T, F, Fut>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, Error>> + Send + 'static,
    {
        let handle = self.enqueue(work);
        match handle.wait(std::time::Duration::from_secs(3600)).await {
            WaitOutcome::Ok(v) => Ok(v),
            WaitOutcome::Timeout => Err(Error::timeout("http request cancelled or stalled")),
            WaitOutcome::Error(e) => Err(e),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded set of [`TaskQueue`]s. New work is assigned to the queue with
/// the smallest running length; the first zero-length queue wins ties.
pub struct TaskQueuePool {
    queues: Vec<TaskQueue>,
}

impl TaskQueuePool {
    /// `n` is clamped the way `nshttptaskthreads` is validated in
    /// [`crate::config::ClientConfig`] (`[1, 64]`).
    pub fn new(n: usize) -> Self {
        let n = n.clamp(1, 64);
        Self {
            queues: (0..n).map(|_| TaskQueue::new()).collect(),
        }
    }

    /// Picks the shortest queue, first zero-length wins on ties (stable:
    /// lowest index among equal-length queues).
    pub fn pick(&self) -> &TaskQueue {
        self.queues
            .iter()
            .min_by_key(|q| q.len())
            .expect("pool always has at least one queue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_completes_and_reports_result() {
        let q = TaskQueue::new();
        let handle = q.enqueue(|_cancel| async move { Ok::<_, Error>(42) });
        match handle.wait(std::time::Duration::from_secs(5)).await {
            WaitOutcome::Ok(v) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_is_observed_by_the_task() {
        let q = TaskQueue::new();
        let handle = q.enqueue(|cancel| async move {
            cancel.cancelled().await;
            Err::<(), _>(Error::protocol("http request cancelled"))
        });
        handle.cancel();
        match handle.wait(std::time::Duration::from_secs(5)).await {
            WaitOutcome::Error(e) => assert_eq!(e.message(), "http request cancelled"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pool_picks_shortest_queue_with_stable_tie_break() {
        let pool = TaskQueuePool::new(3);
        // All queues start at length 0; the first (index 0) must win ties.
        let picked = pool.pick();
        assert_eq!(picked.len(), 0);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }
}
