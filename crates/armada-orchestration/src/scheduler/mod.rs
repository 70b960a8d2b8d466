//! Wave-based planner for batches of dependent work items.
//!
//! [`WaveScheduler::plan_execution`] peels the batch into waves: each wave
//! holds every remaining item whose dependencies were all placed in earlier
//! waves. Planning is a pure, synchronous computation; a dependency cycle
//! stops it early and the stuck items are reported in
//! [`OrchestrationPlan::unscheduled`] instead of failing the call.

mod types;

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use armada_core::config::SchedulerSettings;

pub use types::{
    CollisionRisk, CollisionRiskEntry, CriticalPathEntry, OrchestrationPlan, PlanCheckpoint,
    Priority, RiskType, Wave, WorkItem,
};

/// Gate names added to a wave when a member of the given type is present.
const CHECKPOINTS_BY_KIND: &[(&str, &str)] = &[
    ("testing", "quality validation complete"),
    ("build", "build artifacts validated"),
    ("security", "security review passed"),
    ("deployment", "deployment verified"),
    ("architecture", "architecture approved"),
    ("documentation", "documentation reviewed"),
];

/// Errors from the wave scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Two items in one batch share an id.
    #[error("Duplicate work item id in batch: {id}")]
    DuplicateId { id: String },

    /// Items that could not be placed because they depend on each other.
    #[error(
        "plan incomplete, {} items unresolvable: {}",
        .unscheduled.len(),
        .unscheduled.join(", ")
    )]
    CyclicDependency { unscheduled: Vec<String> },
}

/// Tunables for planning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Items at or above this urgency make a wave blocking and land on the
    /// critical path.
    pub high_priority: Priority,
    /// A wave with more distinct owner tags than this is flagged.
    pub contention_owner_limit: usize,
    /// Activation delay suggested per owner tag for contended waves.
    pub stagger_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            high_priority: Priority::from_ordinal(settings.high_priority_threshold),
            contention_owner_limit: settings.contention_owner_limit,
            stagger_delay: Duration::from_millis(settings.stagger_delay_ms),
        }
    }
}

/// Plans batches of work items into parallel waves.
#[derive(Debug, Clone, Default)]
pub struct WaveScheduler {
    config: SchedulerConfig,
}

impl WaveScheduler {
    pub const fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Build an orchestration plan for `items`.
    ///
    /// Only duplicate ids fail the call. A cycle yields a partial plan whose
    /// `unscheduled` list names the items that could not be placed; use
    /// [`OrchestrationPlan::check`] to turn that into an error.
    pub fn plan_execution(&self, items: &[WorkItem]) -> Result<OrchestrationPlan, SchedulerError> {
        let batch_ids = unique_ids(items)?;

        for item in items {
            for dep in &item.depends_on {
                if !batch_ids.contains(dep.as_str()) {
                    debug!(item = %item.id, dependency = %dep, "Dependency outside batch treated as satisfied");
                }
            }
        }

        let mut remaining: Vec<&WorkItem> = items.iter().collect();
        let mut remaining_ids: HashSet<&str> = batch_ids;
        let mut waves: Vec<Wave> = Vec::new();
        let mut scheduled: Vec<&WorkItem> = Vec::with_capacity(items.len());

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&WorkItem>, Vec<&WorkItem>) =
                remaining.into_iter().partition(|item| {
                    item.depends_on.iter().all(|dep| !remaining_ids.contains(dep.as_str()))
                });

            if ready.is_empty() {
                remaining = blocked;
                break;
            }

            let wave = self.build_wave(waves.len() + 1, &ready);
            debug!(
                wave = wave.wave_number,
                members = wave.member_ids.len(),
                owners = wave.owner_tags.len(),
                duration = wave.estimated_duration,
                blocking = wave.blocking,
                "Wave planned"
            );
            waves.push(wave);

            for item in &ready {
                remaining_ids.remove(item.id.as_str());
            }
            scheduled.extend(ready);
            remaining = blocked;
        }

        let unscheduled: Vec<String> = remaining.iter().map(|i| i.id.clone()).collect();
        if !unscheduled.is_empty() {
            warn!(
                unscheduled = unscheduled.len(),
                ids = ?unscheduled,
                "Circular dependency detected, returning partial plan"
            );
        }

        let sequential = scheduled
            .iter()
            .map(|i| i.estimated_duration)
            .fold(0u64, u64::saturating_add);
        let parallel = waves
            .iter()
            .map(|w| w.estimated_duration)
            .fold(0u64, u64::saturating_add);
        let plan = OrchestrationPlan {
            checkpoints: checkpoints_for(&waves),
            critical_path: self.critical_path(&scheduled),
            collision_risks: self.collision_risks(&waves),
            total_duration_estimate: parallel,
            sequential_duration_estimate: sequential,
            parallel_efficiency: parallel_efficiency(sequential, parallel),
            waves,
            unscheduled,
        };

        info!(
            items = items.len(),
            waves = plan.waves.len(),
            efficiency = plan.parallel_efficiency,
            complete = plan.is_complete(),
            "Orchestration plan built"
        );
        Ok(plan)
    }

    fn is_high_priority(&self, item: &WorkItem) -> bool {
        item.priority <= self.config.high_priority
    }

    fn build_wave(&self, wave_number: usize, members: &[&WorkItem]) -> Wave {
        let mut owner_tags: Vec<String> = Vec::new();
        let mut checkpoints: Vec<String> = Vec::new();

        for item in members {
            if let Some(tag) = &item.owner_tag
                && !owner_tags.contains(tag)
            {
                owner_tags.push(tag.clone());
            }
            if let Some(gate) = checkpoint_for_kind(&item.kind)
                && !checkpoints.iter().any(|c| c == gate)
            {
                checkpoints.push(gate.to_string());
            }
        }

        Wave {
            wave_number,
            member_ids: members.iter().map(|i| i.id.clone()).collect(),
            owner_tags,
            estimated_duration: members
                .iter()
                .map(|i| i.estimated_duration)
                .max()
                .unwrap_or(0),
            blocking: members.iter().any(|i| self.is_high_priority(i)),
            checkpoints,
            peak_collision_risk: members
                .iter()
                .map(|i| i.collision_risk)
                .max()
                .unwrap_or_default(),
        }
    }

    /// High-priority items in batch order. An approximation, not a
    /// longest-path computation.
    fn critical_path(&self, scheduled: &[&WorkItem]) -> Vec<CriticalPathEntry> {
        scheduled
            .iter()
            .filter(|i| self.is_high_priority(i))
            .map(|i| CriticalPathEntry {
                id: i.id.clone(),
                name: i.name.clone(),
                priority: i.priority,
                estimated_duration: i.estimated_duration,
                blocking: !i.depends_on.is_empty(),
            })
            .collect()
    }

    fn collision_risks(&self, waves: &[Wave]) -> Vec<CollisionRiskEntry> {
        waves
            .iter()
            .filter(|w| w.owner_tags.len() > self.config.contention_owner_limit)
            .map(|w| CollisionRiskEntry {
                risk_type: RiskType::ResourceContention,
                wave_number: w.wave_number,
                affected_owner_tags: w.owner_tags.clone(),
                mitigation: format!(
                    "stagger activation by {}ms per owner tag",
                    self.config.stagger_delay.as_millis()
                ),
            })
            .collect()
    }
}

fn unique_ids(items: &[WorkItem]) -> Result<HashSet<&str>, SchedulerError> {
    let mut ids = HashSet::with_capacity(items.len());
    for item in items {
        if !ids.insert(item.id.as_str()) {
            return Err(SchedulerError::DuplicateId {
                id: item.id.clone(),
            });
        }
    }
    Ok(ids)
}

fn checkpoint_for_kind(kind: &str) -> Option<&'static str> {
    CHECKPOINTS_BY_KIND
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(kind))
        .map(|(_, gate)| *gate)
}

fn checkpoints_for(waves: &[Wave]) -> Vec<PlanCheckpoint> {
    waves
        .iter()
        .filter(|w| w.blocking)
        .map(|w| PlanCheckpoint {
            wave_number: w.wave_number,
            conditions: if w.checkpoints.is_empty() {
                vec![format!("wave {} blocking items complete", w.wave_number)]
            } else {
                w.checkpoints.clone()
            },
            owner_tags: w.owner_tags.clone(),
        })
        .collect()
}

/// Rounded percentage of `sequential` saved by `parallel`, clamped to
/// `0..=100`. Zero when there is nothing to run.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parallel_efficiency(sequential: u64, parallel: u64) -> u8 {
    if sequential == 0 {
        return 0;
    }
    let saved = (sequential as f64 - parallel as f64) / sequential as f64 * 100.0;
    saved.round().clamp(0.0, 100.0) as u8
}
