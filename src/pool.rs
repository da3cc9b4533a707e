//! Worker pool: C6.
//!
//! Bounded-concurrency executor with a bounded queue and a caller-runs
//! overflow policy: core size == max size == thread count,
//! queue capacity `5 × threadCount`. When the queue is full, the
//! submitting task runs the work itself instead of waiting for room,
//! the Tokio-native analogue of `java.util.concurrent.ThreadPoolExecutor`'s
//! `CallerRunsPolicy`.
//!
//! Generic over the queued item type so the query engine (C7) can queue
//! typed `Task` values (needed to drain and re-sort the queue by shard on
//! reconfiguration), while the iterator engine (C8) can queue a small
//! driver/dispatch job enum.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Executor<T> = Arc<dyn Fn(T) -> BoxedTask + Send + Sync>;

struct PoolState {
    active_workers: AtomicUsize,
    terminated: AtomicBool,
    cancel_queued: AtomicBool,
    done: Notify,
}

/// Bounded worker pool. Cloning shares the same underlying workers and
/// queue: cheap, `Arc`-backed, the same shape as pgdog's `Pool` handle
/// (`backend/pool/pool_impl.rs`).
pub struct WorkerPool<T: Send + 'static> {
    sender: Arc<Mutex<Option<mpsc::Sender<T>>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    state: Arc<PoolState>,
    executor: Executor<T>,
}

impl<T: Send + 'static> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            state: self.state.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(thread_count: usize, executor: Executor<T>) -> Self {
        let thread_count = thread_count.max(1);
        let capacity = 5 * thread_count;
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let state = Arc::new(PoolState {
            active_workers: AtomicUsize::new(thread_count),
            terminated: AtomicBool::new(false),
            cancel_queued: AtomicBool::new(false),
            done: Notify::new(),
        });

        for id in 0..thread_count {
            let receiver = receiver.clone();
            let state = state.clone();
            let executor = executor.clone();
            tokio::spawn(Self::worker_loop(id, receiver, state, executor));
        }

        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
            state,
            executor,
        }
    }

    async fn worker_loop(
        id: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
        state: Arc<PoolState>,
        executor: Executor<T>,
    ) {
        loop {
            let item = {
                let mut guard = receiver.lock().await;
                guard.recv().await
            };
            let Some(item) = item else {
                break;
            };
            if state.cancel_queued.load(Ordering::Acquire) {
                tracing::debug!(worker = id, "discarding queued task, immediate shutdown");
                continue;
            }
            (executor)(item).await;
        }

        if state.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            state.terminated.store(true, Ordering::Release);
            state.done.notify_waiters();
        }
    }

    /// Submit an item. If the bounded queue is full, runs it on the
    /// calling future instead of waiting for room.
    pub async fn submit(&self, item: T) {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            tracing::debug!("submit after shutdown, dropping task");
            return;
        };

        match sender.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                (self.executor)(item).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Orderly shutdown: stop accepting new tasks, let queued and
    /// in-flight tasks finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Immediate shutdown: stop accepting new tasks and discard any
    /// still-queued tasks without running them. In-flight tasks are not
    /// cancelled.
    pub fn shutdown_now(&self) {
        self.state.cancel_queued.store(true, Ordering::Release);
        self.sender.lock().take();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::Acquire)
    }

    /// Await full termination, optionally bounded by a timeout. Returns
    /// `true` if the pool terminated, `false` on timeout.
    pub async fn await_termination(&self, timeout: Option<Duration>) -> bool {
        if self.is_terminated() {
            return true;
        }
        let notified = self.state.done.notified();
        if self.is_terminated() {
            return true;
        }
        match timeout {
            Some(d) => tokio::time::timeout(d, notified).await.is_ok(),
            None => {
                notified.await;
                true
            }
        }
    }

    /// Drain every item currently sitting in the queue (not yet picked up
    /// by a worker), in FIFO order. Used only by the query engine's
    /// reconfiguration path to re-sort queued tasks by
    /// shard; in-flight tasks are untouched.
    pub async fn drain_queue(&self) -> Vec<T> {
        let mut guard = self.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(item) = guard.try_recv() {
            drained.push(item);
        }
        drained
    }
}
