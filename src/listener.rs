//! Listener registry: C4.
//!
//! Ordered lists of success and failure listeners. Mutable only before
//! `start()`; read without locking afterwards.

use std::sync::Arc;

use crate::batch::{Batch, FailureEvent};
use crate::error::Error;

pub trait SuccessListener: Send + Sync {
    fn on_batch(&self, batch: &Batch);
}

pub trait FailureListener: Send + Sync {
    fn on_failure(&self, event: &FailureEvent);
}

/// Blanket impl so plain closures can be registered directly, the way
/// pgdog registers small `Fn` callbacks for one-off hooks.
impl<F: Fn(&Batch) + Send + Sync> SuccessListener for F {
    fn on_batch(&self, batch: &Batch) {
        self(batch)
    }
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    success: Vec<Arc<dyn SuccessListener>>,
    failure: Vec<Arc<dyn FailureListener>>,
    started: bool,
}

impl ListenerRegistry {
    pub fn add_success(&mut self, listener: Arc<dyn SuccessListener>) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.success.push(listener);
        Ok(())
    }

    pub fn add_failure(&mut self, listener: Arc<dyn FailureListener>) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.failure.push(listener);
        Ok(())
    }

    pub fn set_success(&mut self, listeners: Vec<Arc<dyn SuccessListener>>) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.success = listeners;
        Ok(())
    }

    pub fn set_failure(&mut self, listeners: Vec<Arc<dyn FailureListener>>) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.failure = listeners;
        Ok(())
    }

    pub fn lock(&mut self) {
        self.started = true;
    }

    /// Invoke every success listener in registration order. A listener
    /// that panics does not stop later listeners from running, or the
    /// caller: the unwind is caught and logged, matching the source's
    /// "caught and logged" contract as closely as Rust's unwind model
    /// allows.
    pub fn notify_success(&self, batch: &Batch) {
        for listener in &self.success {
            let listener = listener.clone();
            let batch = batch.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_batch(&batch);
            }));
            if let Err(panic) = result {
                tracing::error!(
                    shard = ?batch.shard.id,
                    "success listener panicked: {}",
                    panic_message(&panic)
                );
            }
        }
    }

    pub fn notify_failure(&self, event: &FailureEvent) {
        for listener in &self.failure {
            let listener = listener.clone();
            let event = event.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_failure(&event);
            }));
            if let Err(panic) = result {
                tracing::error!(
                    shard = ?event.shard().id,
                    "failure listener panicked: {}",
                    panic_message(&panic)
                );
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::batch::BatchBuilder;
    use crate::directory::{Shard, ShardId};
    use crate::error::TransportError;
    use crate::transport::{Query, Transport, TransportHandle, UriPage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn dummy_batch() -> Batch {
        let shard = Shard {
            id: ShardId(1),
            name: "forest-1".to_string(),
            preferred_host: "h1".to_string(),
            database: "docs".to_string(),
        };
        let handle = TransportHandle {
            host: "h1".to_string(),
            client: Arc::new(NoopTransport),
        };
        BatchBuilder::new(shard, handle, 1).build()
    }

    /// A success listener that panics does not prevent later listeners
    /// from being invoked for the same batch.
    #[test]
    fn a_panicking_listener_does_not_block_later_listeners() {
        let ran_after: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let counter = ran_after.clone();

        let mut registry = ListenerRegistry::default();
        registry
            .add_success(Arc::new(|_batch: &Batch| panic!("boom")))
            .unwrap();
        registry
            .add_success(Arc::new(move |_batch: &Batch| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        registry.notify_success(&dummy_batch());

        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mutation_after_lock_is_rejected() {
        let mut registry = ListenerRegistry::default();
        registry.lock();
        assert!(matches!(
            registry.add_success(Arc::new(|_: &Batch| {})),
            Err(Error::AlreadyStarted)
        ));
    }
}
