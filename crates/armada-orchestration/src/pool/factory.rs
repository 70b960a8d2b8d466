//! Worker construction seam and the handle handed out by the pool.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, warn};
use uuid::Uuid;

/// Error type returned by worker factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Builds, warms, cleans and tears down workers of one or more types.
///
/// Construction may be slow (process startup, network handshakes); the pool
/// calls it on a cold start and from background replenishment.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: Send + 'static;

    /// Types to pre-warm during [`WorkerPool::initialize`](super::WorkerPool::initialize).
    fn worker_types(&self) -> Vec<String>;

    /// Construct a fresh worker of `worker_type`.
    async fn create(&self, worker_type: &str) -> Result<Self::Worker, BoxError>;

    /// Bring a freshly constructed worker to a ready state.
    async fn warm(&self, _worker: &mut Self::Worker) -> Result<(), BoxError> {
        Ok(())
    }

    /// Clear transient state before the worker goes back to the pool.
    fn reset(&self, _worker: &mut Self::Worker) {}

    /// Tear down a worker the pool is discarding.
    fn destroy(&self, _worker: Self::Worker) {}
}

/// A worker checked out of the pool.
///
/// Returned to the pool by value through
/// [`WorkerPool::release`](super::WorkerPool::release), so an instance is
/// never reachable from both the pool and a caller.
#[derive(Debug)]
pub struct PooledWorker<W> {
    id: Uuid,
    worker_type: String,
    created_at: Instant,
    uses: u64,
    worker: W,
}

impl<W> PooledWorker<W> {
    pub(crate) fn new(worker_type: &str, worker: W) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_type: worker_type.to_string(),
            created_at: Instant::now(),
            uses: 0,
            worker,
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// Number of times this instance has been handed out.
    pub const fn uses(&self) -> u64 {
        self.uses
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) const fn mark_checked_out(&mut self) {
        self.uses += 1;
    }

    /// Detach the worker from the pool for good.
    pub fn into_inner(self) -> W {
        self.worker
    }
}

impl<W> Deref for PooledWorker<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

impl<W> DerefMut for PooledWorker<W> {
    fn deref_mut(&mut self) -> &mut W {
        &mut self.worker
    }
}

/// Factory wrapper that traces construction and counts outcomes.
pub struct InstrumentedFactory<F> {
    inner: F,
    created: AtomicU64,
    failed: AtomicU64,
}

impl<F> InstrumentedFactory<F> {
    pub const fn new(inner: F) -> Self {
        Self {
            inner,
            created: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub const fn inner(&self) -> &F {
        &self.inner
    }

    /// Successful constructions so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Failed constructions so far.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<F: WorkerFactory> WorkerFactory for InstrumentedFactory<F> {
    type Worker = F::Worker;

    fn worker_types(&self) -> Vec<String> {
        self.inner.worker_types()
    }

    async fn create(&self, worker_type: &str) -> Result<Self::Worker, BoxError> {
        let started = Instant::now();
        let result = self
            .inner
            .create(worker_type)
            .instrument(debug_span!("worker_create", worker_type))
            .await;

        match &result {
            Ok(_) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(worker_type, elapsed = ?started.elapsed(), "Worker constructed");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker_type, elapsed = ?started.elapsed(), error = %e, "Worker construction failed");
            }
        }
        result
    }

    async fn warm(&self, worker: &mut Self::Worker) -> Result<(), BoxError> {
        self.inner
            .warm(worker)
            .instrument(debug_span!("worker_warm"))
            .await
    }

    fn reset(&self, worker: &mut Self::Worker) {
        self.inner.reset(worker);
    }

    fn destroy(&self, worker: Self::Worker) {
        self.inner.destroy(worker);
    }
}
