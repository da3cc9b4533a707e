//! Query engine: C7.
//!
//! Orchestrates `Task` (C5) over the shard directory (C1) through the
//! worker pool (C6). Owns per-shard pagination state, the snapshot
//! timestamp, completion detection, mid-flight reconfiguration, and the
//! retry entry point. This is the largest component, grounded most
//! directly in pgdog's `backend/pool/cluster.rs` `Cluster`: a long-lived
//! handle over a `Mutex`-guarded `Inner`, built once, whose lifecycle
//! methods (`launch`/`shutdown` there, `start`/`stop` here) are serialized
//! through a single lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::batch::{Batch, BatchBuilder, FailureCause, FailureEvent};
use crate::config::BatcherConfig;
use crate::directory::{Directory, Shard, ShardDirectory, ShardId};
use crate::error::{Error, RetryError, TransportError};
use crate::listener::{FailureListener, ListenerRegistry, SuccessListener};
use crate::pool::{BoxedTask, Executor, WorkerPool};
use crate::state::ForestState;
use crate::task::Task;
use crate::transport::{Query, Transport, TransportFactory, TransportHandle};

type ClientMap = IndexMap<String, Arc<dyn Transport>>;

fn build_client_map(directory: &Directory, factory: &TransportFactory) -> ClientMap {
    let mut map = IndexMap::new();
    for host in directory.hosts() {
        let client = factory(&host);
        map.insert(host, client);
    }
    map
}

/// State guarded by one lock: directory, per-shard pagination state, and
/// the quarantine map all change together on reconfiguration, mirroring
/// pgdog's `Mutex<Inner>` (`backend/pool/pool_impl.rs`) over splitting
/// them into separate locks.
struct Inner {
    directory: Directory,
    forest_states: IndexMap<ShardId, Arc<ForestState>>,
    quarantine: IndexMap<ShardId, Vec<Task>>,
}

/// Result of running a single page-fetch. Kept separate from listener
/// notification so the pool-driven path and the synchronous retry path
/// can each decide what to do with a failure without duplicating the
/// fetch protocol itself.
enum Outcome {
    /// Short-circuited before any transport call: duplicate/late task,
    /// job stopped, shard vanished, or a terminal "not found" page.
    Done,
    Success(Batch),
    Failed {
        shard: Shard,
        transport: TransportHandle,
        job_batch_number: u64,
        forest_results_so_far: u64,
        transport_error: TransportError,
    },
}

/// State shared between the engine handle and its spawned worker tasks.
/// Built once at `start()` and held alive by the `QueryEngine` that owns
/// it; workers hold only a `Weak` reference so the pool's executor
/// closure doesn't keep this alive past the engine itself.
struct Shared {
    query: Query,
    transport_factory: TransportFactory,
    inner: Mutex<Inner>,
    clients: ArcSwap<ClientMap>,
    job_batch_counter: AtomicU64,
    job_results_so_far: AtomicU64,
    /// 0 = unset. Written once via compare-exchange.
    snapshot_timestamp: AtomicI64,
    snapshot_mode: bool,
    stopped: AtomicBool,
    page_size: u32,
    job_ticket: u64,
    listeners: ListenerRegistry,
    pool: WorkerPool<Task>,
}

impl Shared {
    /// The page-fetch protocol, minus listener notification. Callers
    /// decide what to do with the outcome.
    async fn execute(&self, task: &Task) -> Outcome {
        let state = {
            let inner = self.inner.lock();
            inner.forest_states.get(&task.shard_id).cloned()
        };
        let Some(state) = state else {
            tracing::debug!(shard = ?task.shard_id, "task for unknown shard, dropping");
            return Outcome::Done;
        };

        if state.is_done() {
            tracing::debug!(shard = ?task.shard_id, start = task.start, "duplicate/late task, shard already done");
            return Outcome::Done;
        }
        if self.stopped.load(Ordering::Acquire) {
            tracing::debug!(shard = ?task.shard_id, "job stopped, dropping task");
            return Outcome::Done;
        }

        let shard = {
            let inner = self.inner.lock();
            inner.directory.get(task.shard_id).cloned()
        };
        let Some(shard) = shard else {
            tracing::warn!(shard = ?task.shard_id, "shard vanished mid-task, quarantining");
            let mut inner = self.inner.lock();
            inner.quarantine.entry(task.shard_id).or_default().push(task.clone());
            return Outcome::Done;
        };

        let clients = self.clients.load();
        let client = match clients.get(&shard.preferred_host) {
            Some(client) => client.clone(),
            None => {
                tracing::error!(host = %shard.preferred_host, "no transport client for host");
                return Outcome::Done;
            }
        };
        let handle = TransportHandle {
            host: shard.preferred_host.clone(),
            client,
        };

        let at_timestamp = if self.snapshot_mode {
            match self.snapshot_timestamp.load(Ordering::Acquire) {
                0 => None,
                ts => Some(ts),
            }
        } else {
            None
        };

        let job_batch_number = task
            .job_batch_override
            .unwrap_or_else(|| self.job_batch_counter.fetch_add(1, Ordering::SeqCst) + 1);

        let result = handle
            .client
            .uris(&self.query, &shard.name, task.start, self.page_size, at_timestamp)
            .await;

        match result {
            Ok(page) => {
                if self.snapshot_mode {
                    let _ = self.snapshot_timestamp.compare_exchange(
                        0,
                        page.server_timestamp,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }

                let full = page.ids.len() as u32 == self.page_size;
                let forest_results_so_far = state.add_results(page.ids.len() as u64);
                let job_results_so_far = self
                    .job_results_so_far
                    .fetch_add(page.ids.len() as u64, Ordering::SeqCst)
                    + page.ids.len() as u64;

                if full {
                    let next = task.next_page(task.start + self.page_size as u64);
                    self.pool.submit(next).await;
                } else {
                    state.mark_done();
                    self.try_terminate();
                }

                let batch = BatchBuilder::new(shard, handle, self.job_ticket)
                    .ids(page.ids)
                    .job_batch_number(job_batch_number)
                    .forest_batch_number(task.forest_batch_number)
                    .job_results_so_far(job_results_so_far)
                    .forest_results_so_far(forest_results_so_far)
                    .server_timestamp(page.server_timestamp)
                    .build();

                Outcome::Success(batch)
            }
            Err(TransportError::NotFound) => {
                state.mark_done();
                self.try_terminate();
                tracing::debug!(shard = ?shard.id, "terminal empty page (not found)");
                Outcome::Done
            }
            Err(transport_error) => {
                state.mark_done();
                Outcome::Failed {
                    shard,
                    transport: handle,
                    job_batch_number,
                    forest_results_so_far: state.results_so_far(),
                    transport_error,
                }
            }
        }
    }

    /// Run a task dispatched by the worker pool and notify listeners
    /// appropriately. Also used for the synchronous snapshot-mode first
    /// task.
    async fn run_task(shared: Arc<Shared>, task: Task) {
        match shared.execute(&task).await {
            Outcome::Done => {}
            Outcome::Success(batch) => shared.listeners.notify_success(&batch),
            Outcome::Failed {
                shard,
                transport,
                job_batch_number,
                forest_results_so_far,
                transport_error,
            } => {
                if task.invoke_failure_listeners {
                    let batch = BatchBuilder::new(shard, transport, shared.job_ticket)
                        .job_batch_number(job_batch_number)
                        .forest_batch_number(task.forest_batch_number)
                        .job_results_so_far(shared.job_results_so_far.load(Ordering::SeqCst))
                        .forest_results_so_far(forest_results_so_far)
                        .build();
                    let event = FailureEvent {
                        batch,
                        cause: FailureCause::from(&transport_error),
                    };
                    shared.listeners.notify_failure(&event);
                    shared.try_terminate();
                } else {
                    // Only the retry path sets invoke_failure_listeners = false, and
                    // retry() awaits execute() directly instead of going through the
                    // pool. Reaching here means a retry task was misrouted.
                    tracing::error!(shard = ?shard.id, "retry task reached the pool executor unexpectedly");
                }
            }
        }
    }

    /// Under the directory/state lock, check whether every shard *currently
    /// in the directory* is done. Shards that were removed and quarantined
    /// keep whatever `isDone` value they had and are deliberately excluded,
    /// so a permanently-quarantined shard never blocks termination.
    fn try_terminate(&self) {
        let all_done = {
            let inner = self.inner.lock();
            inner
                .directory
                .shards()
                .all(|shard| inner.forest_states.get(&shard.id).map(|s| s.is_done()).unwrap_or(false))
        };
        if all_done {
            tracing::info!("all shards done, requesting orderly pool shutdown");
            self.pool.shutdown();
        }
    }

    /// `withForestConfig` once the job has started: diff against the
    /// current directory, drain the queue, quarantine/restart/seed tasks,
    /// then rebuild the client map.
    async fn reconfigure(&self, new_directory: Directory) {
        let drained = self.pool.drain_queue().await;

        let mut keep = Vec::new();
        let mut restarted = Vec::new();
        let mut added = Vec::new();
        let added_count;
        let black_listed_count;
        let restarted_count;

        {
            let mut inner = self.inner.lock();
            let delta = new_directory.diff(&inner.directory);
            inner.directory = new_directory;

            let black_listed: HashSet<ShardId> = delta.black_listed.iter().copied().collect();
            black_listed_count = black_listed.len();

            for task in drained {
                if black_listed.contains(&task.shard_id) {
                    inner.quarantine.entry(task.shard_id).or_default().push(task);
                } else {
                    keep.push(task);
                }
            }

            let quarantined_ids: Vec<ShardId> = inner.quarantine.keys().copied().collect();
            let mut restarted_ids: HashSet<ShardId> = HashSet::new();
            for id in quarantined_ids {
                if inner.directory.contains(id) {
                    if let Some(tasks) = inner.quarantine.shift_remove(&id) {
                        restarted_ids.insert(id);
                        restarted.extend(tasks);
                    }
                }
            }
            restarted_count = restarted.len();

            // A shard just pulled back out of quarantine also shows up in
            // the plain set diff as "added". It already got its original
            // queued task back via the restart path above, so skip it here;
            // restart wins over added.
            for id in &delta.added {
                if restarted_ids.contains(id) {
                    continue;
                }
                inner
                    .forest_states
                    .entry(*id)
                    .or_insert_with(|| Arc::new(ForestState::default()));
                added.push(Task::first_page(*id));
            }
            added_count = added.len();

            let ids: Vec<ShardId> = inner.directory.shards().map(|s| s.id).collect();
            for id in ids {
                inner
                    .forest_states
                    .entry(id)
                    .or_insert_with(|| Arc::new(ForestState::default()));
            }
        }

        let snapshot = self.inner.lock().directory.clone();
        let clients = build_client_map(&snapshot, &self.transport_factory);
        self.clients.store(Arc::new(clients));

        tracing::info!(
            added = added_count,
            black_listed = black_listed_count,
            restarted = restarted_count,
            "reconfigured forest directory"
        );

        for task in keep {
            self.pool.submit(task).await;
        }
        for task in restarted {
            self.pool.submit(task).await;
        }
        for task in added {
            self.pool.submit(task).await;
        }

        self.try_terminate();
    }
}

/// Public handle for the server-query shard-fanout engine (C7). Mutable
/// configuration lives behind `start()`; once started, all further state
/// lives in `Shared` and is reached through `self.shared`.
pub struct QueryEngine {
    query: Query,
    transport_factory: TransportFactory,
    config: Mutex<BatcherConfig>,
    listeners: Mutex<ListenerRegistry>,
    pre_start_directory: Mutex<Directory>,
    shared: once_cell::sync::OnceCell<Arc<Shared>>,
    /// Serializes `start()` and `with_forest_config()` with each other.
    lifecycle: tokio::sync::Mutex<()>,
}

impl QueryEngine {
    pub fn new(
        query: impl Into<Query>,
        directory: &dyn ShardDirectory,
        transport_factory: TransportFactory,
    ) -> Result<Self, Error> {
        let directory = Directory::capture(directory)?;
        Ok(Self {
            query: query.into(),
            transport_factory,
            config: Mutex::new(BatcherConfig::new()),
            listeners: Mutex::new(ListenerRegistry::default()),
            pre_start_directory: Mutex::new(directory),
            shared: once_cell::sync::OnceCell::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn job_name(&self, name: impl Into<String>) -> Result<(), Error> {
        self.config.lock().job_name(name).map(|_| ())
    }

    pub fn page_size(&self, page_size: u32) -> Result<(), Error> {
        self.config.lock().page_size(page_size).map(|_| ())
    }

    pub fn thread_count(&self, thread_count: usize) -> Result<(), Error> {
        self.config.lock().thread_count(thread_count).map(|_| ())
    }

    pub fn snapshot_mode(&self, enabled: bool) -> Result<(), Error> {
        self.config.lock().snapshot_mode(enabled).map(|_| ())
    }

    pub fn add_success_listener(&self, listener: Arc<dyn SuccessListener>) -> Result<(), Error> {
        self.listeners.lock().add_success(listener)
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) -> Result<(), Error> {
        self.listeners.lock().add_failure(listener)
    }

    pub fn set_success_listeners(&self, listeners: Vec<Arc<dyn SuccessListener>>) -> Result<(), Error> {
        self.listeners.lock().set_success(listeners)
    }

    pub fn set_failure_listeners(&self, listeners: Vec<Arc<dyn FailureListener>>) -> Result<(), Error> {
        self.listeners.lock().set_failure(listeners)
    }

    /// Resolve configuration, build the worker pool, and seed one
    /// first-page task per shard. `ticket` is
    /// caller-assigned and opaque to the engine (control
    /// surface `start(ticket)`).
    pub async fn start(&self, ticket: u64) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        if self.shared.get().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let directory = self.pre_start_directory.lock().clone();
        let default_thread_count = directory.len().max(1);
        let (page_size, thread_count, snapshot_mode) = self.config.lock().resolve(default_thread_count);

        let listeners = {
            let mut listeners = self.listeners.lock();
            listeners.lock();
            listeners.clone()
        };

        let clients = build_client_map(&directory, &self.transport_factory);

        let mut forest_states = IndexMap::new();
        for shard in directory.shards() {
            forest_states.insert(shard.id, Arc::new(ForestState::default()));
        }
        let shard_ids: Vec<ShardId> = forest_states.keys().copied().collect();

        let inner = Mutex::new(Inner {
            directory,
            forest_states,
            quarantine: IndexMap::new(),
        });

        let query = self.query.clone();
        let transport_factory = self.transport_factory.clone();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak_for_pool = weak.clone();
            let executor: Executor<Task> = Arc::new(move |task: Task| {
                let weak = weak_for_pool.clone();
                Box::pin(async move {
                    if let Some(shared) = weak.upgrade() {
                        Shared::run_task(shared, task).await;
                    }
                }) as BoxedTask
            });
            let pool = WorkerPool::new(thread_count, executor);

            Shared {
                query,
                transport_factory,
                inner,
                clients: ArcSwap::from_pointee(clients),
                job_batch_counter: AtomicU64::new(0),
                job_results_so_far: AtomicU64::new(0),
                snapshot_timestamp: AtomicI64::new(0),
                snapshot_mode,
                stopped: AtomicBool::new(false),
                page_size,
                job_ticket: ticket,
                listeners,
                pool,
            }
        });

        tracing::info!(
            job = %self.config.lock().job_name_ref(),
            threads = thread_count,
            page_size,
            snapshot_mode,
            shards = shard_ids.len(),
            "starting query engine"
        );

        self.shared.set(shared.clone()).map_err(|_| Error::AlreadyStarted)?;

        if snapshot_mode {
            if let Some((first, rest)) = shard_ids.split_first() {
                Shared::run_task(shared.clone(), Task::first_page(*first)).await;
                for id in rest {
                    shared.pool.submit(Task::first_page(*id)).await;
                }
            }
        } else {
            for id in &shard_ids {
                shared.pool.submit(Task::first_page(*id)).await;
            }
        }

        Ok(())
    }

    /// Push a new directory snapshot. Before `start()` this simply
    /// replaces the directory the job will use; after `start()` it
    /// reconciles against in-flight and queued tasks.
    pub async fn with_forest_config(&self, directory: &dyn ShardDirectory) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        let new_directory = Directory::capture(directory)?;

        let Some(shared) = self.shared.get() else {
            *self.pre_start_directory.lock() = new_directory;
            return Ok(());
        };

        shared.reconfigure(new_directory).await;
        Ok(())
    }

    /// Resume a single failed batch at the exact offset it failed at,
    /// running synchronously on the caller's thread.
    pub async fn retry(&self, event: &FailureEvent) -> Result<(), RetryError> {
        let shared = self.shared.get().ok_or(Error::NotStarted)?;

        let shard_id = event.shard().id;
        let known = {
            let inner = shared.inner.lock();
            inner.directory.contains(shard_id)
        };
        if !known {
            return Err(Error::UnknownShard(shard_id).into());
        }

        {
            let inner = shared.inner.lock();
            if let Some(state) = inner.forest_states.get(&shard_id) {
                state.clear_done();
            }
        }

        let start = event.forest_results_so_far() + 1;
        let task = Task::retry(shard_id, start, event.forest_batch_number(), event.job_batch_number());

        match shared.execute(&task).await {
            Outcome::Done => Ok(()),
            Outcome::Success(batch) => {
                shared.listeners.notify_success(&batch);
                Ok(())
            }
            Outcome::Failed { transport_error, .. } => Err(transport_error.into()),
        }
    }

    pub async fn await_completion(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        let shared = self.shared.get().ok_or(Error::NotStarted)?;
        Ok(shared.pool.await_termination(timeout).await)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.get().map(|s| s.pool.is_terminated()).unwrap_or(false)
    }

    pub fn job_ticket(&self) -> Result<u64, Error> {
        self.shared.get().map(|s| s.job_ticket).ok_or(Error::NotStarted)
    }

    /// Best-effort stop: sets `stopped`, requests immediate pool shutdown,
    /// and warns if any shard is not yet done.
    pub fn stop(&self) -> Result<(), Error> {
        let shared = self.shared.get().ok_or(Error::NotStarted)?;
        shared.stopped.store(true, Ordering::Release);
        shared.pool.shutdown_now();

        let any_not_done = {
            let inner = shared.inner.lock();
            inner
                .directory
                .shards()
                .any(|shard| inner.forest_states.get(&shard.id).map(|s| !s.is_done()).unwrap_or(true))
        };
        if any_not_done {
            tracing::warn!("stop() called with one or more shards not yet done");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::UriPage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct FixedDirectory(Vec<Shard>);

    impl ShardDirectory for FixedDirectory {
        fn list_shards(&self) -> Vec<Shard> {
            self.0.clone()
        }
    }

    fn shard(id: u64, host: &str) -> Shard {
        Shard {
            id: ShardId(id),
            name: format!("forest-{id}"),
            preferred_host: host.to_string(),
            database: "docs".to_string(),
        }
    }

    /// Transport stub: returns pages from a fixed script, one call per
    /// invocation, regardless of shard/host (single-shard tests only).
    struct ScriptedTransport {
        pages: StdMutex<Vec<Result<UriPage, ()>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn uris(
            &self,
            _query: &Query,
            _shard_name: &str,
            _start: u64,
            _page_length: u32,
            _at_timestamp: Option<i64>,
        ) -> Result<UriPage, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Err(TransportError::NotFound);
            }
            match pages.remove(0) {
                Ok(page) => Ok(page),
                Err(()) => Err(TransportError::NotFound),
            }
        }
    }

    fn page(ids: &[&str]) -> Result<UriPage, ()> {
        Ok(UriPage {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            server_timestamp: 100,
        })
    }

    #[tokio::test]
    async fn single_shard_three_pages() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport {
            pages: StdMutex::new(vec![page(&["a", "b"]), page(&["c", "d"]), page(&["e"])]),
            calls: AtomicUsize::new(0),
        });
        let directory = FixedDirectory(vec![shard(1, "h1")]);
        let factory: TransportFactory = Arc::new(move |_host| transport.clone());

        let engine = QueryEngine::new("q", &directory, factory).unwrap();
        engine.page_size(2).unwrap();

        let batches: Arc<StdMutex<Vec<Batch>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = batches.clone();
        engine
            .add_success_listener(Arc::new(move |batch: &Batch| {
                sink.lock().unwrap().push(batch.clone());
            }))
            .unwrap();

        engine.start(7).await.unwrap();
        engine.await_completion(Some(Duration::from_secs(5))).await.unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].ids, vec!["a", "b"]);
        assert_eq!(batches[1].ids, vec!["c", "d"]);
        assert_eq!(batches[2].ids, vec!["e"]);
        assert_eq!(batches[0].forest_batch_number, 1);
        assert_eq!(batches[1].forest_batch_number, 2);
        assert_eq!(batches[2].forest_batch_number, 3);
        assert_eq!(batches[2].forest_results_so_far, 5);
        assert!(engine.is_stopped());
    }

    #[tokio::test]
    async fn rejects_double_start() {
        let directory = FixedDirectory(vec![shard(1, "h1")]);
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport {
            pages: StdMutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let factory: TransportFactory = Arc::new(move |_host| transport.clone());
        let engine = QueryEngine::new("q", &directory, factory).unwrap();
        engine.start(1).await.unwrap();
        assert!(matches!(engine.start(2).await, Err(Error::AlreadyStarted)));
    }
}
