//! `Armada` Orchestration Library
//!
//! In-process services shared by the planning and execution layers:
//! - Wave scheduling of dependent work items
//! - Warm worker pool with adaptive sizing
//! - TTL context cache
//! - Owned background tasks for warm-up and sweeps

pub mod cache;
pub mod pool;
pub mod scheduler;
pub mod task;

pub use cache::{CacheConfig, CacheError, CacheKey, CacheStats, ContextCache};
pub use pool::{
    PoolConfig, PoolError, PoolEvent, PoolStatistics, PooledWorker, ReleaseOutcome, WorkerFactory,
    WorkerPool,
};
pub use scheduler::{OrchestrationPlan, SchedulerConfig, SchedulerError, WaveScheduler, WorkItem};
pub use task::ScheduledTask;
