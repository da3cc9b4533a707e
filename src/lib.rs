//! Parallel, shard-fanout query batcher for a forest-sharded document store.
//!
//! Drives a document-query workload across the forests (shards) of a
//! distributed store, streaming matching identifiers back through
//! caller-supplied listeners in fixed-size batches. Two drivers share the
//! same listener/worker-pool plumbing: [`QueryEngine`] fans a server query
//! across shards, [`IteratorEngine`] batches a pre-existing lazy identifier
//! sequence and round-robins dispatch across hosts.
//!
//! The crate never installs a `tracing` subscriber itself. The embedding
//! application owns that, the same way pgdog's library crates leave
//! subscriber setup to the binary entry point.

pub mod batch;
pub mod batcher;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod iterator_engine;
pub mod listener;
pub mod pool;
pub mod task;
pub mod transport;

mod state;

pub use batch::{Batch, FailureCause, FailureEvent};
pub use batcher::{IteratorBatcher, QueryBatcher};
pub use config::BatcherConfig;
pub use directory::{Shard, ShardDirectory, ShardId};
pub use engine::QueryEngine;
pub use error::{Error, RetryError, TransportError};
pub use iterator_engine::{IdSequence, IteratorEngine};
pub use listener::{FailureListener, ListenerRegistry, SuccessListener};
pub use transport::{Query, Transport, TransportFactory, TransportHandle, UriPage};
