//! Iterator engine: C8.
//!
//! Alternate driver that batches a caller-supplied lazy identifier sequence
//! instead of running a server query, and round-robins dispatch across
//! hosts rather than fanning out per-shard. Shares the worker pool (C6),
//! listener registry (C4) and `Batch` value (C3) with the query engine
//! (`QueryEngine`), but has no per-shard pagination state and no snapshot
//! timestamp: there is only one long-lived driver pulling from the
//! sequence and a stream of batch-dispatch jobs it hands to the pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::batch::{Batch, BatchBuilder, FailureCause, FailureEvent};
use crate::config::BatcherConfig;
use crate::directory::{Directory, Shard, ShardDirectory, ShardId};
use crate::error::Error;
use crate::listener::{FailureListener, ListenerRegistry, SuccessListener};
use crate::pool::{BoxedTask, Executor, WorkerPool};
use crate::transport::{Transport, TransportFactory, TransportHandle};

/// A fallible, caller-supplied source of identifiers. Mirrors a lazy
/// `hasNext`/`next` sequence: `Ok(None)` signals exhaustion, `Err` signals
/// a failure that the driver reports through failure listeners.
pub trait IdSequence: Send {
    fn next(&mut self) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>;
}

/// `(host, client)` pairs snapshotted from a directory at start/reconfigure
/// time, in first-seen host order. Dispatch selects by `batch_number mod
/// len()` over this snapshot to round-robin across hosts.
type ClientList = Vec<(String, Arc<dyn Transport>)>;

fn build_client_list(directory: &Directory, factory: &TransportFactory) -> ClientList {
    directory
        .hosts()
        .into_iter()
        .map(|host| {
            let client = factory(&host);
            (host, client)
        })
        .collect()
}

enum Job {
    Driver,
    Dispatch { ids: Vec<String>, job_batch_number: u64 },
}

struct Shared {
    sequence: AsyncMutex<Option<Box<dyn IdSequence>>>,
    clients: ArcSwap<ClientList>,
    job_batch_counter: AtomicU64,
    job_results_so_far: AtomicU64,
    stopped: AtomicBool,
    exhausted: AtomicBool,
    page_size: u32,
    job_ticket: u64,
    listeners: ListenerRegistry,
    pool: WorkerPool<Job>,
}

impl Shared {
    /// Synthesize a `Shard` standing in for the host a dispatch batch was
    /// sent to. The iterator engine has no real shards; `Batch.shard` is
    /// reused as the host placeholder (id = round-robin index, name/host =
    /// the selected host) rather than forking a second batch type. See
    /// DESIGN.md.
    fn host_placeholder(index: usize, host: &str) -> Shard {
        Shard {
            id: ShardId(index as u64),
            name: host.to_string(),
            preferred_host: host.to_string(),
            database: String::new(),
        }
    }

    async fn run_driver(shared: Arc<Shared>) {
        let mut guard = shared.sequence.lock().await;
        let Some(sequence) = guard.as_mut() else {
            return;
        };

        let mut buffer: Vec<String> = Vec::new();
        loop {
            if shared.stopped.load(Ordering::Acquire) {
                tracing::debug!("iterator driver observed stop(), halting");
                break;
            }

            match sequence.next() {
                Ok(Some(id)) => {
                    buffer.push(id);
                    if buffer.len() as u32 >= shared.page_size {
                        let ids = std::mem::take(&mut buffer);
                        Self::flush(&shared, ids).await;
                    }
                }
                Ok(None) => {
                    if !buffer.is_empty() {
                        let ids = std::mem::take(&mut buffer);
                        Self::flush(&shared, ids).await;
                    }
                    break;
                }
                Err(err) => {
                    tracing::error!("id sequence failed: {err}, terminating iterator job");
                    Self::report_sequence_failure(&shared, err.as_ref());
                    break;
                }
            }
        }

        shared.exhausted.store(true, Ordering::Release);
        drop(guard);
        shared.pool.shutdown();
    }

    async fn flush(shared: &Arc<Shared>, ids: Vec<String>) {
        let job_batch_number = shared.job_batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        shared
            .pool
            .submit(Job::Dispatch { ids, job_batch_number })
            .await;
    }

    async fn run_dispatch(shared: Arc<Shared>, ids: Vec<String>, job_batch_number: u64) {
        let clients = shared.clients.load();
        if clients.is_empty() {
            tracing::error!("no hosts available, dropping dispatch batch");
            return;
        }
        let index = (job_batch_number as usize) % clients.len();
        let (host, client) = clients[index].clone();
        let shard = Self::host_placeholder(index, &host);
        let handle = TransportHandle { host, client };

        let count = ids.len() as u64;
        let job_results_so_far = shared.job_results_so_far.fetch_add(count, Ordering::SeqCst) + count;

        let batch = BatchBuilder::new(shard, handle, shared.job_ticket)
            .ids(ids)
            .job_batch_number(job_batch_number)
            .forest_batch_number(job_batch_number)
            .job_results_so_far(job_results_so_far)
            .forest_results_so_far(job_results_so_far)
            .build();

        shared.listeners.notify_success(&batch);
    }

    fn report_sequence_failure(shared: &Arc<Shared>, err: &(dyn std::error::Error + Send + Sync)) {
        let clients = shared.clients.load();
        let (host, shard) = if let Some((host, _)) = clients.first() {
            (host.clone(), Self::host_placeholder(0, host))
        } else {
            (String::new(), Self::host_placeholder(0, ""))
        };
        let client = clients.first().map(|(_, c)| c.clone());
        let Some(client) = client else {
            tracing::error!("no transport client available to attach to sequence failure event");
            return;
        };
        let handle = TransportHandle { host, client };
        let batch = BatchBuilder::new(shard, handle, shared.job_ticket)
            .job_results_so_far(shared.job_results_so_far.load(Ordering::SeqCst))
            .forest_results_so_far(shared.job_results_so_far.load(Ordering::SeqCst))
            .build();
        let event = FailureEvent {
            batch,
            cause: FailureCause { message: err.to_string() },
        };
        shared.listeners.notify_failure(&event);
    }
}

/// Public handle for the iterator-driven engine (C8).
pub struct IteratorEngine {
    transport_factory: TransportFactory,
    config: Mutex<BatcherConfig>,
    listeners: Mutex<ListenerRegistry>,
    pre_start_directory: Mutex<Directory>,
    sequence: Mutex<Option<Box<dyn IdSequence>>>,
    shared: once_cell::sync::OnceCell<Arc<Shared>>,
    /// Serializes `start()` against itself, the same guard `QueryEngine`
    /// takes on its own lifecycle methods.
    lifecycle: tokio::sync::Mutex<()>,
}

impl IteratorEngine {
    pub fn new(
        sequence: Box<dyn IdSequence>,
        directory: &dyn ShardDirectory,
        transport_factory: TransportFactory,
    ) -> Result<Self, Error> {
        let directory = Directory::capture(directory)?;
        Ok(Self {
            transport_factory,
            config: Mutex::new(BatcherConfig::new()),
            listeners: Mutex::new(ListenerRegistry::default()),
            pre_start_directory: Mutex::new(directory),
            sequence: Mutex::new(Some(sequence)),
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

    pub fn add_success_listener(&self, listener: Arc<dyn SuccessListener>) -> Result<(), Error> {
        self.listeners.lock().add_success(listener)
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) -> Result<(), Error> {
        self.listeners.lock().add_failure(listener)
    }

    /// Resolve configuration, build the worker pool sized to the host
    /// count (the iterator variant's thread-count default), and submit the
    /// single long-lived driver job.
    pub async fn start(&self, ticket: u64) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        if self.shared.get().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let directory = self.pre_start_directory.lock().clone();
        let default_thread_count = directory.hosts().len().max(1);
        let (page_size, thread_count, _snapshot_mode) = self.config.lock().resolve(default_thread_count);

        let listeners = {
            let mut listeners = self.listeners.lock();
            listeners.lock();
            listeners.clone()
        };

        let clients = build_client_list(&directory, &self.transport_factory);
        let sequence = self
            .sequence
            .lock()
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak_for_pool = weak.clone();
            let executor: Executor<Job> = Arc::new(move |job: Job| {
                let weak = weak_for_pool.clone();
                Box::pin(async move {
                    if let Some(shared) = weak.upgrade() {
                        match job {
                            Job::Driver => Shared::run_driver(shared).await,
                            Job::Dispatch { ids, job_batch_number } => {
                                Shared::run_dispatch(shared, ids, job_batch_number).await
                            }
                        }
                    }
                }) as BoxedTask
            });
            let pool = WorkerPool::new(thread_count, executor);

            Shared {
                sequence: AsyncMutex::new(Some(sequence)),
                clients: ArcSwap::from_pointee(clients),
                job_batch_counter: AtomicU64::new(0),
                job_results_so_far: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
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
            "starting iterator engine"
        );

        self.shared.set(shared.clone()).map_err(|_| Error::AlreadyStarted)?;
        shared.pool.submit(Job::Driver).await;

        Ok(())
    }

    /// Rebuild the host→client list from a fresh directory. The driver's
    /// round-robin index is recomputed against whatever snapshot is loaded
    /// at dispatch time, so this never touches in-flight work.
    pub async fn with_forest_config(&self, directory: &dyn ShardDirectory) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        let new_directory = Directory::capture(directory)?;

        let Some(shared) = self.shared.get() else {
            *self.pre_start_directory.lock() = new_directory;
            return Ok(());
        };

        let clients = build_client_list(&new_directory, &self.transport_factory);
        shared.clients.store(Arc::new(clients));
        Ok(())
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
    /// and warns if the sequence was not drained.
    pub fn stop(&self) -> Result<(), Error> {
        let shared = self.shared.get().ok_or(Error::NotStarted)?;
        shared.stopped.store(true, Ordering::Release);
        shared.pool.shutdown_now();
        if !shared.exhausted.load(Ordering::Acquire) {
            tracing::warn!("stop() called before the id sequence was exhausted");
        }
        Ok(())
    }
}
