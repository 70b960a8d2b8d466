//! Warm worker pool keyed by worker type.
//!
//! The [`WorkerPool`] keeps a queue of pre-initialised workers per type so
//! that [`WorkerPool::acquire`] is a pop in the common case. Misses construct
//! synchronously; every acquire then tops the queue back up in the
//! background, towards a target that follows the type's hit rate.
//!
//! Lifecycle notifications are published on a broadcast channel (see
//! [`WorkerPool::subscribe`]).

mod factory;
mod stats;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use armada_core::config::{PoolSettings, PoolSizing};

use crate::task::ScheduledTask;

pub use factory::{BoxError, InstrumentedFactory, PooledWorker, WorkerFactory};
pub use stats::{PoolStatistics, TypeStatistics, target_size};

use stats::{AllocationStats, hit_rate};

/// Broadcast channel buffer size for pool events.
const EVENT_CAPACITY: usize = 256;

/// Runtime configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_sizing: PoolSizing,
    /// Per-type sizing overrides.
    pub types: HashMap<String, PoolSizing>,
    /// Grace period before the initial warm-up pass.
    pub warmup_delay: Duration,
    /// Allocation latency samples kept for the rolling average.
    pub stats_window: usize,
}

impl PoolConfig {
    pub fn sizing_for(&self, worker_type: &str) -> PoolSizing {
        self.types
            .get(worker_type)
            .copied()
            .unwrap_or(self.default_sizing)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            default_sizing: settings.default_sizing(),
            types: settings.types.clone(),
            warmup_delay: Duration::from_millis(settings.warmup_delay_ms),
            stats_window: settings.stats_window,
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// The initial warm-up pass added an instance.
    WarmedUp { worker_type: String },
    /// A caller received an instance.
    Allocated {
        worker_type: String,
        worker_id: Uuid,
        hit: bool,
        latency: Duration,
    },
    /// A released instance went back to the queue.
    Released { worker_type: String, worker_id: Uuid },
    /// A released instance was destroyed because the queue was full.
    Discarded { worker_type: String, worker_id: Uuid },
    /// Background replenishment added instances.
    Replenished { worker_type: String, added: usize },
    /// Warm-up or replenishment failed; nothing was surfaced to callers.
    BackgroundFailure { worker_type: String, reason: String },
    /// The pool was shut down and its idle instances destroyed.
    ShutDown { discarded: usize },
}

/// What [`WorkerPool::release`] did with the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Returned,
    Discarded,
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was shut down.
    #[error("Worker pool has been shut down")]
    Closed,

    /// The factory could not build or warm a worker.
    #[error("Failed to construct worker of type '{worker_type}': {source}")]
    Construction {
        worker_type: String,
        #[source]
        source: BoxError,
    },
}

/// Idle queue and counters for one worker type.
struct TypeQueue<W> {
    sizing: PoolSizing,
    state: Mutex<QueueState<W>>,
    replenishing: AtomicBool,
}

struct QueueState<W> {
    idle: VecDeque<PooledWorker<W>>,
    hits: u64,
    misses: u64,
}

impl<W> QueueState<W> {
    fn target(&self, sizing: PoolSizing) -> usize {
        target_size(sizing, hit_rate(self.hits, self.misses))
    }
}

impl<W> TypeQueue<W> {
    fn new(sizing: PoolSizing) -> Self {
        Self {
            sizing,
            state: Mutex::new(QueueState {
                idle: VecDeque::with_capacity(sizing.max_size),
                hits: 0,
                misses: 0,
            }),
            replenishing: AtomicBool::new(false),
        }
    }
}

/// Clears a type's replenishing flag when the run ends, however it ends.
struct ReplenishGuard<'a>(&'a AtomicBool);

impl Drop for ReplenishGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PoolInner<F: WorkerFactory> {
    factory: F,
    config: PoolConfig,
    queues: RwLock<HashMap<String, Arc<TypeQueue<F::Worker>>>>,
    stats: Mutex<AllocationStats>,
    events: broadcast::Sender<PoolEvent>,
    /// Background replenishment and warm-up work.
    tracker: TaskTracker,
    cancel: CancellationToken,
    warmup: Mutex<Option<ScheduledTask>>,
    /// Serialises the tracker's close/wait/reopen cycles.
    settle_gate: Mutex<()>,
}

/// Pool of warm workers, cheap to clone and share between tasks.
pub struct WorkerPool<F: WorkerFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: WorkerFactory> Clone for WorkerPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: WorkerFactory> WorkerPool<F> {
    /// Create an empty pool. No worker is built until [`Self::initialize`]
    /// or the first [`Self::acquire`].
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            base_size = config.default_sizing.base_size,
            max_size = config.default_sizing.max_size,
            overrides = config.types.len(),
            "WorkerPool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                factory,
                stats: Mutex::new(AllocationStats::new(config.stats_window)),
                config,
                queues: RwLock::new(HashMap::new()),
                events,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                warmup: Mutex::new(None),
                settle_gate: Mutex::new(()),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Receive lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Schedule the background warm-up pass and return immediately.
    ///
    /// After the configured grace period one instance per known worker type
    /// is built. Failures are logged per type and never reach the caller.
    pub async fn initialize(&self) {
        if self.inner.cancel.is_cancelled() {
            warn!("initialize called on a shut down pool");
            return;
        }

        let mut slot = self.inner.warmup.lock().await;
        if slot.is_some() {
            debug!("Worker pool already initialized");
            return;
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(ScheduledTask::after(
            "pool-warmup",
            self.inner.config.warmup_delay,
            async move {
                let runner = Arc::clone(&inner);
                inner.tracker.spawn(async move { runner.warm_up().await });
            },
        ));
        drop(slot);

        info!(delay = ?self.inner.config.warmup_delay, "Worker pool warm-up scheduled");
    }

    /// Run the warm-up pass now, on the caller's task.
    pub async fn warm_up(&self) {
        self.inner.warm_up().await;
    }

    /// Check out a worker of `worker_type`.
    ///
    /// A queued instance is returned without waiting on construction (hit);
    /// otherwise one is built and warmed in place (miss), and a failure is
    /// returned as [`PoolError::Construction`]. Either way a background
    /// refill of the type's queue is started.
    pub async fn acquire(&self, worker_type: &str) -> Result<PooledWorker<F::Worker>, PoolError> {
        if self.inner.cancel.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let queue = self.inner.queue(worker_type).await;
        let popped = {
            let mut state = queue.state.lock().await;
            let popped = state.idle.pop_front();
            if popped.is_some() {
                state.hits += 1;
            } else {
                state.misses += 1;
            }
            popped
        };

        let hit = popped.is_some();
        let mut worker = match popped {
            Some(worker) => worker,
            None => match self.inner.construct(worker_type).await {
                Ok(worker) => worker,
                Err(e) => {
                    self.inner.stats.lock().await.record(false, None);
                    warn!(%worker_type, error = %e, "Cold start failed");
                    return Err(e);
                }
            },
        };

        worker.mark_checked_out();
        let latency = started.elapsed();
        self.inner.stats.lock().await.record(hit, Some(latency));
        debug!(%worker_type, worker_id = %worker.id(), hit, ?latency, "Worker allocated");
        self.inner.emit(PoolEvent::Allocated {
            worker_type: worker_type.to_string(),
            worker_id: worker.id(),
            hit,
            latency,
        });

        self.inner.spawn_replenish(worker_type);
        Ok(worker)
    }

    /// Return a worker. It is reset, then queued if its type is below
    /// `max_size` and destroyed otherwise.
    pub async fn release(&self, mut worker: PooledWorker<F::Worker>) -> ReleaseOutcome {
        self.inner.factory.reset(&mut worker);
        let worker_type = worker.worker_type().to_string();
        let worker_id = worker.id();

        if self.inner.cancel.is_cancelled() {
            self.inner.discard(worker);
            return ReleaseOutcome::Discarded;
        }

        let queue = self.inner.queue(&worker_type).await;
        let rejected = {
            let mut state = queue.state.lock().await;
            if state.idle.len() < queue.sizing.max_size {
                state.idle.push_back(worker);
                None
            } else {
                Some(worker)
            }
        };

        if let Some(worker) = rejected {
            debug!(%worker_type, %worker_id, "Pool full, discarding released worker");
            self.inner.discard(worker);
            ReleaseOutcome::Discarded
        } else {
            debug!(%worker_type, %worker_id, "Worker returned to pool");
            self.inner.emit(PoolEvent::Released {
                worker_type,
                worker_id,
            });
            ReleaseOutcome::Returned
        }
    }

    /// Top up `worker_type` towards its adaptive target and return the
    /// number of instances added. Concurrent calls for one type collapse
    /// into a single run.
    pub async fn replenish(&self, worker_type: &str) -> Result<usize, PoolError> {
        self.inner.replenish(worker_type).await
    }

    /// Wait until all background warm-up and replenishment has finished.
    pub async fn settle(&self) {
        let _gate = self.inner.settle_gate.lock().await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        // Once shut down the tracker stays closed.
        if !self.inner.cancel.is_cancelled() {
            self.inner.tracker.reopen();
        }
    }

    pub async fn statistics(&self) -> PoolStatistics {
        let queues: Vec<(String, Arc<TypeQueue<F::Worker>>)> = self
            .inner
            .queues
            .read()
            .await
            .iter()
            .map(|(name, queue)| (name.clone(), Arc::clone(queue)))
            .collect();

        let mut snapshot = self.inner.stats.lock().await.snapshot();
        for (name, queue) in queues {
            let state = queue.state.lock().await;
            let per_type = TypeStatistics {
                size: state.idle.len(),
                target_size: state.target(queue.sizing),
                hits: state.hits,
                misses: state.misses,
                hit_rate: hit_rate(state.hits, state.misses).unwrap_or(0.0),
                sizing: queue.sizing,
            };
            drop(state);
            snapshot.current_size += per_type.size;
            snapshot.per_type.insert(name, per_type);
        }
        snapshot
    }

    /// Idle instances currently queued for `worker_type`.
    pub async fn idle_count(&self, worker_type: &str) -> usize {
        let queue = self.inner.queues.read().await.get(worker_type).cloned();
        match queue {
            Some(queue) => queue.state.lock().await.idle.len(),
            None => 0,
        }
    }

    /// Stop background work, destroy every idle instance and reset the
    /// statistics. Later acquires fail with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let warmup = self.inner.warmup.lock().await.take();
        if let Some(task) = warmup {
            task.stop().await;
        }
        {
            let _gate = self.inner.settle_gate.lock().await;
            self.inner.tracker.close();
            self.inner.tracker.wait().await;
        }

        let queues: Vec<Arc<TypeQueue<F::Worker>>> = self
            .inner
            .queues
            .write()
            .await
            .drain()
            .map(|(_, queue)| queue)
            .collect();

        let mut discarded = 0usize;
        for queue in queues {
            let idle: Vec<PooledWorker<F::Worker>> =
                queue.state.lock().await.idle.drain(..).collect();
            for worker in idle {
                self.inner.factory.destroy(worker.into_inner());
                discarded += 1;
            }
        }

        self.inner.stats.lock().await.reset();
        self.inner.emit(PoolEvent::ShutDown { discarded });
        info!(discarded, "Worker pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl<F: WorkerFactory> PoolInner<F> {
    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn queue(&self, worker_type: &str) -> Arc<TypeQueue<F::Worker>> {
        let existing = self.queues.read().await.get(worker_type).cloned();
        if let Some(queue) = existing {
            return queue;
        }

        let mut queues = self.queues.write().await;
        let queue = queues
            .entry(worker_type.to_string())
            .or_insert_with(|| Arc::new(TypeQueue::new(self.config.sizing_for(worker_type))));
        Arc::clone(queue)
    }

    /// Build and warm one worker.
    async fn construct(&self, worker_type: &str) -> Result<PooledWorker<F::Worker>, PoolError> {
        let mut worker = self
            .factory
            .create(worker_type)
            .await
            .map_err(|source| PoolError::Construction {
                worker_type: worker_type.to_string(),
                source,
            })?;

        if let Err(source) = self.factory.warm(&mut worker).await {
            self.factory.destroy(worker);
            return Err(PoolError::Construction {
                worker_type: worker_type.to_string(),
                source,
            });
        }

        Ok(PooledWorker::new(worker_type, worker))
    }

    fn discard(&self, worker: PooledWorker<F::Worker>) {
        let worker_type = worker.worker_type().to_string();
        let worker_id = worker.id();
        self.factory.destroy(worker.into_inner());
        self.emit(PoolEvent::Discarded {
            worker_type,
            worker_id,
        });
    }

    /// Fire-and-forget refill. Errors are logged and published, never
    /// returned to the acquiring caller.
    fn spawn_replenish(self: &Arc<Self>, worker_type: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        let worker_type = worker_type.to_string();
        self.tracker.spawn(async move {
            if let Err(e) = inner.replenish(&worker_type).await {
                warn!(%worker_type, error = %e, "Background replenishment failed");
                inner.emit(PoolEvent::BackgroundFailure {
                    worker_type,
                    reason: e.to_string(),
                });
            }
        });
    }

    async fn replenish(&self, worker_type: &str) -> Result<usize, PoolError> {
        let queue = self.queue(worker_type).await;
        if queue.replenishing.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let _guard = ReplenishGuard(&queue.replenishing);

        let mut added = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            {
                let state = queue.state.lock().await;
                let target = state.target(queue.sizing).min(queue.sizing.max_size);
                if state.idle.len() >= target {
                    break;
                }
            }

            let worker = tokio::select! {
                built = self.construct(worker_type) => built?,
                () = self.cancel.cancelled() => break,
            };

            let overflow = {
                let mut state = queue.state.lock().await;
                if state.idle.len() < queue.sizing.max_size {
                    state.idle.push_back(worker);
                    None
                } else {
                    Some(worker)
                }
            };
            if let Some(worker) = overflow {
                self.factory.destroy(worker.into_inner());
                break;
            }
            added += 1;
        }

        if added > 0 {
            debug!(%worker_type, added, "Pool replenished");
            self.emit(PoolEvent::Replenished {
                worker_type: worker_type.to_string(),
                added,
            });
        }
        Ok(added)
    }

    async fn warm_up(&self) {
        let types = self.factory.worker_types();
        info!(types = types.len(), "Warming worker pool");

        for worker_type in types {
            if self.cancel.is_cancelled() {
                break;
            }
            let queue = self.queue(&worker_type).await;
            if !queue.state.lock().await.idle.is_empty() {
                continue;
            }

            let built = tokio::select! {
                built = self.construct(&worker_type) => built,
                () = self.cancel.cancelled() => break,
            };

            match built {
                Ok(worker) => {
                    let overflow = {
                        let mut state = queue.state.lock().await;
                        if state.idle.len() < queue.sizing.max_size {
                            state.idle.push_back(worker);
                            None
                        } else {
                            Some(worker)
                        }
                    };
                    match overflow {
                        Some(worker) => self.factory.destroy(worker.into_inner()),
                        None => {
                            debug!(%worker_type, "Worker warmed");
                            self.emit(PoolEvent::WarmedUp { worker_type });
                        }
                    }
                }
                Err(e) => {
                    warn!(%worker_type, error = %e, "Warm-up failed for worker type");
                    self.emit(PoolEvent::BackgroundFailure {
                        worker_type,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}
