//! Convoy and member records for one scheduling run.
//!
//! A convoy is created `pending`, driven through `running` by the scheduler,
//! and ends in exactly one terminal status computed from member tallies:
//! `completed` only when every member completed, `failed` when stopped early
//! or nothing completed, `partial` for a mixed outcome.

use serde::{Deserialize, Serialize};

use crate::id::{generate_id, now_secs};

/// One scheduling run over a batch of work items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Convoy {
    /// Opaque unique id.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Free-text description.
    pub description: String,

    /// Members in submission order; start order follows this ordering.
    pub members: Vec<ConvoyMember>,

    /// Overall run status.
    pub status: ConvoyStatus,

    /// Parallelism ceiling for this run.
    pub max_parallel: usize,

    /// Resource-adaptive tuning policy.
    pub auto_tuning: AutoTuningPolicy,

    /// Cancel not-yet-started members on the first failure.
    pub stop_on_first_failure: bool,

    /// Originating issue reference, if any.
    pub issue_ref: Option<i64>,

    /// Unix timestamp in seconds.
    pub created_at: i64,

    /// Unix timestamp in seconds.
    pub updated_at: i64,
}

impl Convoy {
    /// Create a new pending convoy from `(handler_id, work_item_id)` pairs.
    pub fn new(name: &str, description: &str, pairs: &[(String, String)]) -> Self {
        let now = now_secs();
        Self {
            id: generate_id(),
            name: name.to_string(),
            description: description.to_string(),
            members: pairs
                .iter()
                .map(|(handler_id, work_item_id)| ConvoyMember::new(handler_id, work_item_id))
                .collect(),
            status: ConvoyStatus::Pending,
            max_parallel: 4,
            auto_tuning: AutoTuningPolicy::default(),
            stop_on_first_failure: false,
            issue_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current progress computed from member states.
    pub fn progress(&self) -> ConvoyProgress {
        let total = self.members.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut running = 0;
        let mut pending = 0;

        for member in &self.members {
            match member.status {
                MemberStatus::Completed => completed += 1,
                MemberStatus::Failed => failed += 1,
                MemberStatus::Running => running += 1,
                MemberStatus::Pending => pending += 1,
            }
        }

        let progress_percent = if total == 0 {
            100
        } else {
            (100 * (completed + failed)) / total
        };

        ConvoyProgress {
            total,
            completed,
            failed,
            running,
            pending,
            progress_percent: progress_percent as u8,
        }
    }

    /// Terminal status from member tallies.
    ///
    /// `stopped_early` marks a stop-on-first-failure abort, which is always
    /// `failed` regardless of how the survivors fared.
    pub fn final_status(&self, stopped_early: bool) -> ConvoyStatus {
        if stopped_early {
            return ConvoyStatus::Failed;
        }

        let progress = self.progress();
        if progress.completed == progress.total {
            ConvoyStatus::Completed
        } else if progress.completed == 0 {
            ConvoyStatus::Failed
        } else {
            ConvoyStatus::Partial
        }
    }

    /// Update the timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// A work item's participation record within one convoy run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvoyMember {
    /// Handler identifier ("agent type").
    pub handler_id: String,

    /// Work item this member executes.
    pub work_item_id: String,

    /// Member state machine.
    pub status: MemberStatus,

    /// Error text, set when the handler raised or admission failed.
    pub error: Option<String>,

    /// Result payload from a successful handler invocation.
    pub result: Option<serde_json::Value>,
}

impl ConvoyMember {
    /// Create a pending member.
    pub fn new(handler_id: &str, work_item_id: &str) -> Self {
        Self {
            handler_id: handler_id.to_string(),
            work_item_id: work_item_id.to_string(),
            status: MemberStatus::Pending,
            error: None,
            result: None,
        }
    }
}

/// Resource-adaptive tuning policy for one convoy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoTuningPolicy {
    /// Consult the resource monitor when true; otherwise `max_parallel` rules.
    pub enabled: bool,
    /// Parallelism floor under resource pressure.
    pub baseline_parallel: usize,
    /// CPU usage percent above which throttling kicks in.
    pub cpu_threshold: f64,
    /// Memory usage percent above which throttling kicks in.
    pub memory_threshold: f64,
    /// Weight of CPU availability in the availability score.
    pub cpu_weight: f64,
    /// Weight of memory availability in the availability score.
    pub memory_weight: f64,
}

impl Default for AutoTuningPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline_parallel: 1,
            cpu_threshold: 85.0,
            memory_threshold: 85.0,
            cpu_weight: 0.5,
            memory_weight: 0.5,
        }
    }
}

/// Convoy state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConvoyStatus {
    /// Created, not yet executed
    Pending,
    /// Execution in progress
    Running,
    /// Every member completed
    Completed,
    /// Mixed member outcomes
    Partial,
    /// Stopped early or nothing completed
    Failed,
}

impl ConvoyStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvoyStatus::Pending => "pending",
            ConvoyStatus::Running => "running",
            ConvoyStatus::Completed => "completed",
            ConvoyStatus::Partial => "partial",
            ConvoyStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConvoyStatus::Completed | ConvoyStatus::Partial | ConvoyStatus::Failed
        )
    }
}

impl std::fmt::Display for ConvoyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Member state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Not yet dispatched
    Pending,
    /// Handler invocation in flight
    Running,
    /// Handler returned a result
    Completed,
    /// Handler raised, admission failed, or the persistence flush failed
    Failed,
}

impl MemberStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Pending => "pending",
            MemberStatus::Running => "running",
            MemberStatus::Completed => "completed",
            MemberStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MemberStatus::Completed | MemberStatus::Failed)
    }
}

/// Point-in-time progress report for one convoy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvoyProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    /// floor(100 * (completed + failed) / total)
    pub progress_percent: u8,
}
