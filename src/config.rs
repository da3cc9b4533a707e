//! Configuration surface.
//!
//! All setters are forbidden after `start()`. pgdog's own config layers
//! (e.g. `backend/pool/cluster.rs`'s `Cluster`) are immutable from
//! construction and need no such guard; this one is mutable only up to
//! `start()`.

use crate::error::Error;

const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub(crate) job_name: String,
    pub(crate) page_size: u32,
    pub(crate) thread_count: Option<usize>,
    pub(crate) snapshot_mode: bool,
    started: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            thread_count: None,
            snapshot_mode: false,
            started: false,
        }
    }
}

impl BatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_name(&mut self, name: impl Into<String>) -> Result<&mut Self, Error> {
        self.guard()?;
        self.job_name = name.into();
        Ok(self)
    }

    pub fn page_size(&mut self, page_size: u32) -> Result<&mut Self, Error> {
        self.guard()?;
        self.page_size = page_size;
        Ok(self)
    }

    /// Set the worker thread count. Must be >= 1.
    ///
    /// Open question resolution: the source's validator reads
    /// the *current* thread count rather than the incoming value, so it
    /// never rejects a non-positive request. We treat that as a bug and
    /// reject it here, since a silently-permissive thread count of zero
    /// would deadlock `start()` (a pool with zero workers never drains its
    /// queue). See DESIGN.md.
    pub fn thread_count(&mut self, thread_count: usize) -> Result<&mut Self, Error> {
        self.guard()?;
        if thread_count < 1 {
            return Err(Error::InvalidThreadCount(thread_count));
        }
        self.thread_count = Some(thread_count);
        Ok(self)
    }

    pub fn snapshot_mode(&mut self, enabled: bool) -> Result<&mut Self, Error> {
        self.guard()?;
        self.snapshot_mode = enabled;
        Ok(self)
    }

    pub fn job_name_ref(&self) -> &str {
        &self.job_name
    }

    fn guard(&self) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    /// Resolve defaults at `start()` and lock the config against further
    /// mutation. `default_thread_count` is the query-variant default
    /// (shard count) or the iterator-variant default (host count).
    pub(crate) fn resolve(&mut self, default_thread_count: usize) -> (u32, usize, bool) {
        self.started = true;

        if self.page_size < 1 {
            tracing::warn!(
                configured = self.page_size,
                "page size must be >= 1, coercing to 1"
            );
            self.page_size = 1;
        }

        let thread_count = self.thread_count.unwrap_or(default_thread_count).max(1);

        (self.page_size, thread_count, self.snapshot_mode)
    }
}
