//! Transport facade: C2.
//!
//! The only way the core talks to the document store. The query
//! definition type is deliberately opaque (`Query`): the core never
//! inspects it, only hands it to the transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

/// Opaque query definition, passed through to the transport unmodified.
#[derive(Debug, Clone)]
pub struct Query(pub String);

impl<S: Into<String>> From<S> for Query {
    fn from(value: S) -> Self {
        Query(value.into())
    }
}

/// One page of results from a single `uris` call.
#[derive(Debug, Clone, Default)]
pub struct UriPage {
    pub ids: Vec<String>,
    pub server_timestamp: i64,
}

/// `uris(query, shard, start, pageLength, atTimestamp?) -> (ids, serverTimestamp)`.
/// Implementations issue "list URIs matching query Q against shard F
/// starting at offset S, with page length N, optionally at server
/// timestamp T".
#[async_trait]
pub trait Transport: Send + Sync {
    async fn uris(
        &self,
        query: &Query,
        shard_name: &str,
        start: u64,
        page_length: u32,
        at_timestamp: Option<i64>,
    ) -> Result<UriPage, TransportError>;
}

/// A named handle to the transport client bound to one shard's currently
/// preferred host, handed to listeners inside a `Batch` as its transport
/// handle for that shard's host.
#[derive(Clone)]
pub struct TransportHandle {
    pub host: String,
    pub client: std::sync::Arc<dyn Transport>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("host", &self.host)
            .finish()
    }
}

/// Builds a transport client for a given host. Called once per host on
/// `start()` and again on every `withForestConfig` reconfiguration, so the
/// host→client map can be rebuilt from scratch rather than patched in place.
pub type TransportFactory = Arc<dyn Fn(&str) -> Arc<dyn Transport> + Send + Sync>;
