//! Work item records persisted by the `WorkItemStore`.
//!
//! Every mutation goes through the store's optimistic update; the `version`
//! column is the only concurrency discipline guarding shared durable state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::{generate_id, now_secs, to_iso8601};

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// Opaque unique id.
    pub id: String,

    /// Short human-readable title.
    pub title: String,

    /// Free-text description.
    pub description: String,

    /// Lifecycle status.
    pub status: WorkItemStatus,

    /// External issue/PR number, if any.
    pub issue_ref: Option<i64>,

    /// Assignee identifier, if any.
    pub assignee: Option<String>,

    /// Convoy this item currently belongs to, if any.
    pub convoy_id: Option<String>,

    /// Scheduling priority; higher runs first.
    pub priority: i64,

    /// Arbitrary handler-facing context.
    pub context: HashMap<String, serde_json::Value>,

    /// Arbitrary bookkeeping metadata.
    pub metadata: HashMap<String, String>,

    /// Ordered artifact references produced for this item.
    pub artifacts: Vec<String>,

    /// Ids of items this item depends on.
    pub depends_on: Vec<String>,

    /// Ids of items this item blocks.
    pub blocks: Vec<String>,

    /// Free-text labels.
    pub labels: Vec<String>,

    /// Optimistic-lock version; incremented by every successful update.
    pub version: i64,

    /// Unix timestamp in seconds.
    pub created_at: i64,

    /// Unix timestamp in seconds.
    pub updated_at: i64,
}

impl WorkItem {
    /// Create a new pending work item with a generated id and version 1.
    pub fn new(title: &str, description: &str) -> Self {
        let now = now_secs();
        Self {
            id: generate_id(),
            title: title.to_string(),
            description: description.to_string(),
            status: WorkItemStatus::Pending,
            issue_ref: None,
            assignee: None,
            convoy_id: None,
            priority: 0,
            context: HashMap::new(),
            metadata: HashMap::new(),
            artifacts: Vec::new(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            labels: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder-style assignee override.
    pub fn with_assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }

    /// Builder-style convoy membership.
    pub fn with_convoy(mut self, convoy_id: &str) -> Self {
        self.convoy_id = Some(convoy_id.to_string());
        self
    }

    /// Creation time as ISO-8601 text.
    pub fn created_at_iso(&self) -> String {
        to_iso8601(self.created_at)
    }

    /// Last-update time as ISO-8601 text.
    pub fn updated_at_iso(&self) -> String {
        to_iso8601(self.updated_at)
    }
}

/// Work item lifecycle state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting to be picked up
    Pending,
    /// A handler is working on it
    InProgress,
    /// Waiting on a dependency
    Blocked,
    /// Finished successfully
    Completed,
    /// Finished with an unrecoverable error
    Failed,
    /// Withdrawn before completion
    Cancelled,
}

impl WorkItemStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Blocked => "blocked",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from the string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkItemStatus::Pending),
            "in_progress" => Some(WorkItemStatus::InProgress),
            "blocked" => Some(WorkItemStatus::Blocked),
            "completed" => Some(WorkItemStatus::Completed),
            "failed" => Some(WorkItemStatus::Failed),
            "cancelled" => Some(WorkItemStatus::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::Failed | WorkItemStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
