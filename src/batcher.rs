//! Public facade and builders.
//!
//! `QueryBatcher`/`IteratorBatcher` are thin, fluent wrappers over
//! [`QueryEngine`]/[`IteratorEngine`] that chain configuration the way
//! pgdog's `Config`-style structs do (`backend/pool/config.rs`): each
//! setter consumes and returns `Self` wrapped in `Result`, so a caller
//! builds up options in one expression and only has to handle the first
//! misuse error, instead of checking each setter call individually.

use std::sync::Arc;

use crate::directory::ShardDirectory;
use crate::engine::QueryEngine;
use crate::error::Error;
use crate::iterator_engine::{IdSequence, IteratorEngine};
use crate::listener::{FailureListener, SuccessListener};
use crate::transport::TransportFactory;

/// Fluent builder over [`QueryEngine`], the server-query shard-fanout
/// driver.
pub struct QueryBatcher(QueryEngine);

impl QueryBatcher {
    pub fn new(
        query: impl Into<crate::transport::Query>,
        directory: &dyn ShardDirectory,
        transport_factory: TransportFactory,
    ) -> Result<Self, Error> {
        Ok(Self(QueryEngine::new(query, directory, transport_factory)?))
    }

    pub fn job_name(self, name: impl Into<String>) -> Result<Self, Error> {
        self.0.job_name(name)?;
        Ok(self)
    }

    pub fn page_size(self, page_size: u32) -> Result<Self, Error> {
        self.0.page_size(page_size)?;
        Ok(self)
    }

    pub fn thread_count(self, thread_count: usize) -> Result<Self, Error> {
        self.0.thread_count(thread_count)?;
        Ok(self)
    }

    pub fn snapshot_mode(self, enabled: bool) -> Result<Self, Error> {
        self.0.snapshot_mode(enabled)?;
        Ok(self)
    }

    pub fn success_listener(self, listener: Arc<dyn SuccessListener>) -> Result<Self, Error> {
        self.0.add_success_listener(listener)?;
        Ok(self)
    }

    pub fn failure_listener(self, listener: Arc<dyn FailureListener>) -> Result<Self, Error> {
        self.0.add_failure_listener(listener)?;
        Ok(self)
    }

    /// Finish building and hand back the underlying engine, ready for
    /// `start(ticket)`.
    pub fn build(self) -> QueryEngine {
        self.0
    }
}

/// Fluent builder over [`IteratorEngine`], the id-sequence-driven driver.
pub struct IteratorBatcher(IteratorEngine);

impl IteratorBatcher {
    pub fn new(
        sequence: Box<dyn IdSequence>,
        directory: &dyn ShardDirectory,
        transport_factory: TransportFactory,
    ) -> Result<Self, Error> {
        Ok(Self(IteratorEngine::new(sequence, directory, transport_factory)?))
    }

    pub fn job_name(self, name: impl Into<String>) -> Result<Self, Error> {
        self.0.job_name(name)?;
        Ok(self)
    }

    pub fn page_size(self, page_size: u32) -> Result<Self, Error> {
        self.0.page_size(page_size)?;
        Ok(self)
    }

    pub fn thread_count(self, thread_count: usize) -> Result<Self, Error> {
        self.0.thread_count(thread_count)?;
        Ok(self)
    }

    pub fn success_listener(self, listener: Arc<dyn SuccessListener>) -> Result<Self, Error> {
        self.0.add_success_listener(listener)?;
        Ok(self)
    }

    pub fn failure_listener(self, listener: Arc<dyn FailureListener>) -> Result<Self, Error> {
        self.0.add_failure_listener(listener)?;
        Ok(self)
    }

    pub fn build(self) -> IteratorEngine {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::{Shard, ShardId};
    use crate::error::TransportError;
    use crate::transport::{Query, Transport, UriPage};
    use async_trait::async_trait;

    struct FixedDirectory(Vec<Shard>);
    impl ShardDirectory for FixedDirectory {
        fn list_shards(&self) -> Vec<Shard> {
            self.0.clone()
        }
    }

    struct NoopTransport;
    #[async_trait]
    impl Transport for NoopTransport {
        async fn uris(
            &self,
            _query: &Query,
            _shard_name: &str,
            _start: u64,
            _page_length: u32,
            _at_timestamp: Option<i64>,
        ) -> Result<UriPage, TransportError> {
            Err(TransportError::NotFound)
        }
    }

    #[test]
    fn builder_chains_configuration() {
        let directory = FixedDirectory(vec![Shard {
            id: ShardId(1),
            name: "forest-1".into(),
            preferred_host: "h1".into(),
            database: "docs".into(),
        }]);
        let transport: Arc<dyn Transport> = Arc::new(NoopTransport);
        let factory: TransportFactory = Arc::new(move |_host| transport.clone());

        let engine = QueryBatcher::new("select 1", &directory, factory)
            .unwrap()
            .job_name("demo")
            .unwrap()
            .page_size(50)
            .unwrap()
            .thread_count(4)
            .unwrap()
            .build();

        // Configuration is only rejected after start(); building doesn't start the job.
        assert!(!engine.is_stopped());
    }
}
