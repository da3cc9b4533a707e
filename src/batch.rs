//! Batch object: C3.
//!
//! Immutable per-invocation value handed to listeners. Built through
//! `BatchBuilder` because the hot path sets many optional fields across a
//! short chain.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::directory::Shard;
use crate::error::TransportError;
use crate::transport::TransportHandle;

/// Immutable snapshot handed to success listeners.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<String>,
    pub job_batch_number: u64,
    pub forest_batch_number: u64,
    pub job_results_so_far: u64,
    pub forest_results_so_far: u64,
    pub shard: Shard,
    pub transport: TransportHandle,
    pub server_timestamp: i64,
    pub wall_clock: u128,
    pub job_ticket: u64,
}

/// Failure event handed to failure listeners, and to `retry()`.
///
/// Carries the `Batch` as it stood at the moment of failure (no items,
/// counters as of the last successful page) plus the underlying cause.
/// `retry()` reads `forest_results_so_far` and
/// `job_batch_number` off the embedded batch to resume at the exact
/// pagination offset where the batch failed.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub batch: Batch,
    pub cause: FailureCause,
}

impl FailureEvent {
    pub fn shard(&self) -> &Shard {
        &self.batch.shard
    }

    pub fn forest_batch_number(&self) -> u64 {
        self.batch.forest_batch_number
    }

    pub fn forest_results_so_far(&self) -> u64 {
        self.batch.forest_results_so_far
    }

    pub fn job_batch_number(&self) -> u64 {
        self.batch.job_batch_number
    }
}

/// The underlying cause carried by a `FailureEvent`. Transport errors are
/// not `Clone`, so the event stores a rendered description alongside the
/// page-fetch protocol's decision of what kind of failure this was.
#[derive(Debug, Clone)]
pub struct FailureCause {
    pub message: String,
}

impl From<&TransportError> for FailureCause {
    fn from(err: &TransportError) -> Self {
        FailureCause {
            message: err.to_string(),
        }
    }
}

pub(crate) struct BatchBuilder {
    ids: Vec<String>,
    job_batch_number: u64,
    forest_batch_number: u64,
    job_results_so_far: u64,
    forest_results_so_far: u64,
    shard: Shard,
    transport: TransportHandle,
    server_timestamp: i64,
    job_ticket: u64,
}

impl BatchBuilder {
    pub(crate) fn new(shard: Shard, transport: TransportHandle, job_ticket: u64) -> Self {
        Self {
            ids: Vec::new(),
            job_batch_number: 0,
            forest_batch_number: 0,
            job_results_so_far: 0,
            forest_results_so_far: 0,
            shard,
            transport,
            server_timestamp: 0,
            job_ticket,
        }
    }

    pub(crate) fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = ids;
        self
    }

    pub(crate) fn job_batch_number(mut self, n: u64) -> Self {
        self.job_batch_number = n;
        self
    }

    pub(crate) fn forest_batch_number(mut self, n: u64) -> Self {
        self.forest_batch_number = n;
        self
    }

    pub(crate) fn job_results_so_far(mut self, n: u64) -> Self {
        self.job_results_so_far = n;
        self
    }

    pub(crate) fn forest_results_so_far(mut self, n: u64) -> Self {
        self.forest_results_so_far = n;
        self
    }

    pub(crate) fn server_timestamp(mut self, t: i64) -> Self {
        self.server_timestamp = t;
        self
    }

    pub(crate) fn build(self) -> Batch {
        Batch {
            ids: self.ids,
            job_batch_number: self.job_batch_number,
            forest_batch_number: self.forest_batch_number,
            job_results_so_far: self.job_results_so_far,
            forest_results_so_far: self.forest_results_so_far,
            shard: self.shard,
            transport: self.transport,
            server_timestamp: self.server_timestamp,
            wall_clock: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
            job_ticket: self.job_ticket,
        }
    }
}
