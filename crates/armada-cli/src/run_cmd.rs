//! `armada run`: simulated execution of a batch.
//!
//! Each wave checks out one worker per member from a [`WorkerPool`], runs
//! the members concurrently, looks up per-type context through the
//! [`ContextCache`] and returns the workers before the next wave starts.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use armada_core::Config;
use armada_orchestration::cache::{CacheConfig, CacheKey, CacheStats, ContextCache};
use armada_orchestration::pool::{
    BoxError, InstrumentedFactory, PoolConfig, PoolStatistics, WorkerFactory, WorkerPool,
};
use armada_orchestration::scheduler::{OrchestrationPlan, WorkItem};

use crate::{batch, plan_cmd, render};

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of work items.
    pub batch: PathBuf,

    /// Simulated worker construction time in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub construct_ms: u64,

    /// Milliseconds of simulated work per unit of estimated duration.
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,
}

/// Stand-in for an expensive worker.
#[derive(Debug)]
pub struct SimulatedWorker {
    pub worker_type: String,
    pub serial: u64,
    /// Items run since the last reset.
    pub completed: Vec<String>,
}

/// Factory whose construction cost is a fixed sleep.
pub struct SimulatedFactory {
    worker_types: Vec<String>,
    construct_delay: Duration,
    next_serial: std::sync::atomic::AtomicU64,
}

impl SimulatedFactory {
    pub fn new(worker_types: Vec<String>, construct_delay: Duration) -> Self {
        Self {
            worker_types,
            construct_delay,
            next_serial: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl WorkerFactory for SimulatedFactory {
    type Worker = SimulatedWorker;

    fn worker_types(&self) -> Vec<String> {
        self.worker_types.clone()
    }

    async fn create(&self, worker_type: &str) -> Result<SimulatedWorker, BoxError> {
        tokio::time::sleep(self.construct_delay).await;
        Ok(SimulatedWorker {
            worker_type: worker_type.to_string(),
            serial: self
                .next_serial
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            completed: Vec::new(),
        })
    }

    fn reset(&self, worker: &mut SimulatedWorker) {
        worker.completed.clear();
    }
}

/// Final statistics of a simulated run.
#[derive(Debug)]
pub struct RunReport {
    pub plan: OrchestrationPlan,
    pub pool: PoolStatistics,
    pub cache: CacheStats,
    pub constructed: u64,
}

type SimPool = WorkerPool<InstrumentedFactory<SimulatedFactory>>;

/// Plan `items` and execute the scheduled waves.
///
/// Items left unscheduled by a cycle are not run.
pub async fn simulate(
    items: &[WorkItem],
    config: &Config,
    construct_delay: Duration,
    time_scale: f64,
) -> anyhow::Result<RunReport> {
    let plan = plan_cmd::plan_batch(items, config)?;

    let worker_types: Vec<String> = items
        .iter()
        .map(|item| batch::worker_type_of(item).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let factory = InstrumentedFactory::new(SimulatedFactory::new(worker_types, construct_delay));
    let pool: SimPool = WorkerPool::new(factory, PoolConfig::from(&config.pool));
    let cache: ContextCache<String> = ContextCache::new(CacheConfig::from(&config.cache));

    pool.initialize().await;
    cache.start_sweeper().await;

    let result = run_waves(&plan, items, &pool, &cache, time_scale).await;

    pool.settle().await;
    let report = RunReport {
        pool: pool.statistics().await,
        cache: cache.stats().await,
        constructed: pool.factory().created(),
        plan,
    };
    cache.stop_sweeper().await;
    pool.shutdown().await;
    result?;

    #[cfg(feature = "metrics")]
    {
        let meters = armada_core::metrics::OrchestrationMeters::new();
        for (worker_type, stats) in &report.pool.per_type {
            meters.record_pool(worker_type, stats.hits, stats.misses);
        }
        meters.record_cache(report.cache.hits, report.cache.misses);
    }

    Ok(report)
}

/// Run each wave to completion before starting the next.
///
/// A failing member does not cancel its siblings: the wave is drained so
/// every checked-out worker goes back to the pool, then the first error is
/// returned.
async fn run_waves<F>(
    plan: &OrchestrationPlan,
    items: &[WorkItem],
    pool: &WorkerPool<F>,
    cache: &ContextCache<String>,
    time_scale: f64,
) -> anyhow::Result<()>
where
    F: WorkerFactory<Worker = SimulatedWorker>,
{
    for wave in &plan.waves {
        let span = info_span!("wave", number = wave.wave_number, members = wave.member_ids.len());
        let mut members = JoinSet::new();

        for id in &wave.member_ids {
            let Some(item) = items.iter().find(|item| &item.id == id) else {
                continue;
            };
            let item = item.clone();
            let pool = pool.clone();
            let cache = cache.clone();
            members.spawn(
                async move { run_item(&item, &pool, &cache, time_scale).await }
                    .instrument(span.clone()),
            );
        }

        let mut first_error = None;
        while let Some(joined) = members.join_next().await {
            let Err(e) = joined.map_err(anyhow::Error::from).and_then(|run| run) else {
                continue;
            };
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                warn!(parent: &span, error = %e, "Further wave member failed");
            }
        }
        if let Some(e) = first_error {
            return Err(e.context(format!("wave {} failed", wave.wave_number)));
        }
        info!(parent: &span, "Wave complete");
    }
    Ok(())
}

async fn run_item<F>(
    item: &WorkItem,
    pool: &WorkerPool<F>,
    cache: &ContextCache<String>,
    time_scale: f64,
) -> anyhow::Result<()>
where
    F: WorkerFactory<Worker = SimulatedWorker>,
{
    let worker_type = batch::worker_type_of(item);
    let mut worker = pool.acquire(worker_type).await?;

    let context = cache
        .get_or_insert_with(CacheKey::for_payload(worker_type, &item.kind), || async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, std::convert::Infallible>(format!("context for {worker_type}/{}", item.kind))
        })
        .await?;

    tokio::time::sleep(work_time(item.estimated_duration, time_scale)).await;
    worker.completed.push(item.id.clone());
    debug!(
        item = %item.id,
        worker_type,
        serial = worker.serial,
        age = ?worker.age(),
        context_len = context.len(),
        "Item finished"
    );

    pool.release(worker).await;
    Ok(())
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn work_time(estimated_duration: u64, time_scale: f64) -> Duration {
    let millis = (estimated_duration as f64 * time_scale).max(0.0);
    Duration::from_micros((millis * 1000.0).round() as u64)
}

/// Execute the subcommand. Returns `false` when the plan is incomplete.
pub async fn run(args: &RunArgs, config: &Config) -> anyhow::Result<bool> {
    let items = batch::load_batch(&args.batch)?;
    info!(path = %args.batch.display(), items = items.len(), "Running batch");

    let report = simulate(
        &items,
        config,
        Duration::from_millis(args.construct_ms),
        args.time_scale,
    )
    .await?;

    let mut out = io::stdout().lock();
    render::write_plan(&mut out, &report.plan)?;
    writeln!(out)?;
    render::write_pool_stats(&mut out, &report.pool)?;
    render::write_cache_stats(&mut out, &report.cache)?;
    writeln!(out, "Workers constructed: {}", report.constructed)?;
    Ok(report.plan.is_complete())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn batch_items() -> Vec<WorkItem> {
        batch::parse_batch(
            r#"[
                {"id": "compile", "type": "build", "ownerTag": "builder", "estimatedDuration": 10},
                {"id": "lint", "type": "build", "ownerTag": "builder", "estimatedDuration": 2},
                {"id": "unit", "type": "testing", "ownerTag": "tester", "estimatedDuration": 5, "dependsOn": ["compile"]},
                {"id": "docs", "type": "documentation", "estimatedDuration": 3, "dependsOn": ["compile"]}
            ]"#,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn simulate_runs_every_scheduled_item() {
        let report = simulate(&batch_items(), &Config::default(), Duration::from_millis(20), 1.0)
            .await
            .unwrap();

        assert_eq!(report.plan.waves.len(), 2);
        assert_eq!(report.pool.total_requests, 4);
        assert_eq!(report.pool.hits + report.pool.misses, 4);
        // One entry per distinct (worker type, item type) pair.
        assert_eq!(report.cache.entries, 3);
        assert_eq!(report.cache.hits + report.cache.misses, 4);
        assert!(report.constructed >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn simulate_skips_unschedulable_items() {
        let items = batch::parse_batch(
            r#"[
                {"id": "ok", "estimatedDuration": 1},
                {"id": "a", "dependsOn": ["b"]},
                {"id": "b", "dependsOn": ["a"]}
            ]"#,
        )
        .unwrap();

        let report = simulate(&items, &Config::default(), Duration::from_millis(1), 1.0)
            .await
            .unwrap();
        assert!(!report.plan.is_complete());
        assert_eq!(report.pool.total_requests, 1);
    }

    /// Builds plain simulated workers, except for the `broken` type.
    struct PartlyBrokenFactory;

    #[async_trait]
    impl WorkerFactory for PartlyBrokenFactory {
        type Worker = SimulatedWorker;

        fn worker_types(&self) -> Vec<String> {
            vec!["builder".into(), "broken".into()]
        }

        async fn create(&self, worker_type: &str) -> Result<SimulatedWorker, BoxError> {
            if worker_type == "broken" {
                return Err("no broken workers today".into());
            }
            Ok(SimulatedWorker {
                worker_type: worker_type.to_string(),
                serial: 0,
                completed: Vec::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_member_lets_siblings_return_their_workers() {
        let items = batch::parse_batch(
            r#"[
                {"id": "ok", "ownerTag": "builder", "estimatedDuration": 10},
                {"id": "bad", "ownerTag": "broken", "estimatedDuration": 1}
            ]"#,
        )
        .unwrap();
        let plan = plan_cmd::plan_batch(&items, &Config::default()).unwrap();
        assert_eq!(plan.waves.len(), 1);

        let config = PoolConfig {
            default_sizing: armada_core::config::PoolSizing {
                base_size: 0,
                min_size: 0,
                max_size: 2,
            },
            ..PoolConfig::default()
        };
        let pool = WorkerPool::new(PartlyBrokenFactory, config);
        let cache: ContextCache<String> = ContextCache::new(CacheConfig::default());

        let err = run_waves(&plan, &items, &pool, &cache, 1.0).await.unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        assert_eq!(pool.idle_count("builder").await, 1);
    }

    #[test]
    fn work_time_scales_duration() {
        assert_eq!(work_time(10, 2.5), Duration::from_millis(25));
        assert_eq!(work_time(10, -1.0), Duration::ZERO);
    }
}
