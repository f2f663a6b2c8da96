//! Core domain types shared by the validator, the policy engine and the gateway.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler-assigned id of one workflow execution.
pub type InstanceId = u64;

/// Scheduler-assigned code of a project.
pub type ProjectCode = u64;

/// Scheduler-assigned code of a workflow definition.
pub type DefinitionCode = u64;

/// Task type string the scheduler uses for sub-workflow tasks.
pub const SUB_PROCESS_TASK_TYPE: &str = "SUB_PROCESS";

/// Whether a task does its own work or launches a child workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ordinary,
    SubWorkflow,
}

impl TaskKind {
    /// Map the scheduler's `taskType` field.
    #[must_use]
    pub fn from_task_type(task_type: &str) -> Self {
        if task_type.trim().eq_ignore_ascii_case(SUB_PROCESS_TASK_TYPE) {
            Self::SubWorkflow
        } else {
            Self::Ordinary
        }
    }
}

/// One task inside a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: u64,
    pub name: String,
    pub kind: TaskKind,
    /// Raw status as reported by the scheduler (name or numeric code).
    pub status: String,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Child instance for sub-workflow tasks, when the child was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_instance_id: Option<InstanceId>,
}

impl TaskRecord {
    /// An ordinary task with the given status and retry bookkeeping.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: TaskKind::Ordinary,
            status: status.into(),
            retry_count: 0,
            max_retries: 0,
            child_instance_id: None,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self
    }

    /// Turn this task into a sub-workflow task pointing at `child`.
    #[must_use]
    pub fn with_child(mut self, child: Option<InstanceId>) -> Self {
        self.kind = TaskKind::SubWorkflow;
        self.child_instance_id = child;
        self
    }

    #[must_use]
    pub fn is_sub_workflow(&self) -> bool {
        self.kind == TaskKind::SubWorkflow
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub name: String,
    pub definition_code: DefinitionCode,
    pub project_code: ProjectCode,
    /// Overall raw status of the instance.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_times: u32,
    /// Ordered task list. Summaries returned by listing calls leave it empty.
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

/// A project known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub code: ProjectCode,
    pub name: String,
}

/// A workflow definition inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: DefinitionCode,
    pub name: String,
}

/// Closed interval `[start, end]` used to bound which instances are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window covering the `hours` before `now`, both ends inclusive.
    #[must_use]
    pub fn ending_at(now: DateTime<Utc>, hours: u32) -> Self {
        Self {
            start: now - Duration::hours(i64::from(hours)),
            end: now,
        }
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}
