//! Work items and the plan produced from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::SchedulerError;

/// Urgency of a work item. Lower ordinal = more urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Map an ordinal back to a priority, saturating at [`Priority::Low`].
    pub const fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => Self::Critical,
            1 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// How likely an item is to collide with other concurrently active work.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CollisionRisk {
    #[default]
    Low,
    Medium,
    High,
}

/// A unit of work submitted for planning.
///
/// The scheduler never looks inside the work; it only reads the fields
/// below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Unique within a batch.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Category tag, e.g. `"testing"` or `"build"`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub priority: Priority,
    /// Estimated duration in abstract time units.
    #[serde(default)]
    pub estimated_duration: u64,
    /// Ids this item waits for. Ids outside the batch count as satisfied.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Grouping key, usually the worker type that executes the item.
    #[serde(default)]
    pub owner_tag: Option<String>,
    #[serde(default)]
    pub collision_risk: CollisionRisk,
}

impl WorkItem {
    /// Create an item with default priority, zero duration and no
    /// dependencies.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: String::new(),
            priority: Priority::default(),
            estimated_duration: 0,
            depends_on: Vec::new(),
            owner_tag: None,
            collision_risk: CollisionRisk::default(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_duration(mut self, duration: u64) -> Self {
        self.estimated_duration = duration;
        self
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner_tag: impl Into<String>) -> Self {
        self.owner_tag = Some(owner_tag.into());
        self
    }

    #[must_use]
    pub const fn with_collision_risk(mut self, risk: CollisionRisk) -> Self {
        self.collision_risk = risk;
        self
    }
}

/// A set of items that can run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wave {
    /// 1-based.
    pub wave_number: usize,
    /// Members in batch insertion order.
    pub member_ids: Vec<String>,
    /// Distinct owner tags, in order of first appearance.
    pub owner_tags: Vec<String>,
    /// Longest member duration.
    pub estimated_duration: u64,
    /// Whether any member is high-priority.
    pub blocking: bool,
    /// Gate names derived from the member types present.
    pub checkpoints: Vec<String>,
    pub peak_collision_risk: CollisionRisk,
}

/// Gate attached to a blocking wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCheckpoint {
    pub wave_number: usize,
    pub conditions: Vec<String>,
    pub owner_tags: Vec<String>,
}

/// One high-priority item on the (approximate) critical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPathEntry {
    pub id: String,
    pub name: String,
    pub priority: Priority,
    pub estimated_duration: u64,
    /// True when the item waits on at least one dependency.
    pub blocking: bool,
}

/// Kind of risk flagged on a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskType {
    ResourceContention,
}

impl fmt::Display for RiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceContention => f.write_str("resource contention"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollisionRiskEntry {
    pub risk_type: RiskType,
    pub wave_number: usize,
    pub affected_owner_tags: Vec<String>,
    pub mitigation: String,
}

/// Result of planning one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationPlan {
    pub waves: Vec<Wave>,
    pub checkpoints: Vec<PlanCheckpoint>,
    pub critical_path: Vec<CriticalPathEntry>,
    /// Sum of wave durations.
    pub total_duration_estimate: u64,
    /// Sum of scheduled item durations.
    pub sequential_duration_estimate: u64,
    /// Percentage saved by running waves in parallel, in `0..=100`.
    pub parallel_efficiency: u8,
    pub collision_risks: Vec<CollisionRiskEntry>,
    /// Items caught in a dependency cycle, in batch order. Empty when the
    /// plan is complete.
    pub unscheduled: Vec<String>,
}

impl OrchestrationPlan {
    pub fn is_complete(&self) -> bool {
        self.unscheduled.is_empty()
    }

    /// Turn an incomplete plan into [`SchedulerError::CyclicDependency`].
    pub fn check(&self) -> Result<(), SchedulerError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(SchedulerError::CyclicDependency {
                unscheduled: self.unscheduled.clone(),
            })
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.waves.iter().map(|w| w.member_ids.len()).sum()
    }
}
