//! Recursive eligibility check for failed workflow instances.
//!
//! An instance is recoverable when every task in it, and in every
//! sub-workflow instance reachable from it, has reached a terminal state, at
//! least one of those tasks failed, and every failed task used up its retry
//! budget. Anything less means the scheduler is still working on it or will
//! retry on its own, and resuming would race with it.
//!
//! Child instances are fetched through an [`InstanceSource`] so the walk can
//! be driven by the live API or by an in-memory fixture.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::debug;

use crate::classify::{classify, retry_budget, TaskCategory};
use crate::error::{GatewayError, ValidationError};
use crate::types::{InstanceId, WorkflowInstance};

pub const REASON_RECOVERABLE: &str = "all failed tasks exhausted their retry budget";
pub const REASON_RUNNING: &str = "tasks still running";
pub const REASON_RETRY_BUDGET: &str = "retry budget not exhausted";
pub const REASON_NO_FAILED: &str = "no failed tasks";

/// Default nesting limit for sub-workflow recursion.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Fetches full instances (tasks included) by id.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    async fn fetch_instance(&self, id: InstanceId) -> Result<WorkflowInstance, GatewayError>;
}

/// A condition that keeps an instance from being recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum UnmetCondition {
    TaskStillRunning {
        task_id: u64,
        task_name: String,
        status: String,
    },
    RetryBudgetRemaining {
        task_id: u64,
        task_name: String,
        retry_count: u32,
        max_retries: u32,
    },
    NoFailedTasks,
}

impl std::fmt::Display for UnmetCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskStillRunning {
                task_name, status, ..
            } => write!(f, "task `{task_name}` is {status}"),
            Self::RetryBudgetRemaining {
                task_name,
                retry_count,
                max_retries,
                ..
            } => write!(
                f,
                "task `{task_name}` failed with retries left ({retry_count}/{max_retries})"
            ),
            Self::NoFailedTasks => f.write_str("no task failed"),
        }
    }
}

/// An unmet condition and the instance it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmetEntry {
    pub instance_id: InstanceId,
    #[serde(flatten)]
    pub condition: UnmetCondition,
}

/// Task counts across the inspected subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskTally {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub in_progress: usize,
}

impl TaskTally {
    fn record(&mut self, category: TaskCategory) {
        self.total += 1;
        match category {
            TaskCategory::Done => self.done += 1,
            TaskCategory::Failed => self.failed += 1,
            TaskCategory::InProgress => self.in_progress += 1,
        }
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub recoverable: bool,
    pub reason: String,
    pub unmet: Vec<UnmetEntry>,
    pub tally: TaskTally,
    pub instances_checked: usize,
}

impl ValidationVerdict {
    /// Unmet conditions found in a given instance of the subtree.
    pub fn unmet_for(&self, instance_id: InstanceId) -> impl Iterator<Item = &UnmetCondition> {
        self.unmet
            .iter()
            .filter(move |entry| entry.instance_id == instance_id)
            .map(|entry| &entry.condition)
    }
}

#[derive(Default)]
struct Walk {
    unmet: Vec<UnmetEntry>,
    tally: TaskTally,
    instances: usize,
    saw_failed: bool,
}

/// Decide whether `instance` can be resumed from its failed tasks.
///
/// Sub-workflow children are fetched from `source` and checked to at most
/// `max_depth` levels below `instance`; deeper nesting is an error rather
/// than a silent pass.
pub async fn validate<S>(
    instance: &WorkflowInstance,
    source: &S,
    max_depth: usize,
) -> Result<ValidationVerdict, ValidationError>
where
    S: InstanceSource + ?Sized,
{
    let mut walk = Walk::default();
    walk_instance(instance, source, 0, max_depth, &mut walk).await?;

    if walk.unmet.is_empty() && !walk.saw_failed {
        walk.unmet.push(UnmetEntry {
            instance_id: instance.id,
            condition: UnmetCondition::NoFailedTasks,
        });
    }

    let reason = if walk
        .unmet
        .iter()
        .any(|e| matches!(e.condition, UnmetCondition::TaskStillRunning { .. }))
    {
        REASON_RUNNING
    } else if walk
        .unmet
        .iter()
        .any(|e| matches!(e.condition, UnmetCondition::RetryBudgetRemaining { .. }))
    {
        REASON_RETRY_BUDGET
    } else if walk.unmet.is_empty() {
        REASON_RECOVERABLE
    } else {
        REASON_NO_FAILED
    };

    let verdict = ValidationVerdict {
        recoverable: walk.unmet.is_empty(),
        reason: reason.to_string(),
        unmet: walk.unmet,
        tally: walk.tally,
        instances_checked: walk.instances,
    };

    debug!(
        instance_id = instance.id,
        recoverable = verdict.recoverable,
        reason = %verdict.reason,
        instances = verdict.instances_checked,
        "Validated workflow instance"
    );

    Ok(verdict)
}

fn walk_instance<'a, S>(
    instance: &'a WorkflowInstance,
    source: &'a S,
    depth: usize,
    max_depth: usize,
    walk: &'a mut Walk,
) -> BoxFuture<'a, Result<(), ValidationError>>
where
    S: InstanceSource + ?Sized,
{
    Box::pin(async move {
        if depth > max_depth {
            return Err(ValidationError::DepthExceeded {
                instance_id: instance.id,
                limit: max_depth,
            });
        }
        walk.instances += 1;

        let mut categories = Vec::with_capacity(instance.tasks.len());
        for task in &instance.tasks {
            let category =
                classify(&task.status).map_err(|source| ValidationError::UnknownStatus {
                    instance_id: instance.id,
                    task: task.name.clone(),
                    source,
                })?;
            walk.tally.record(category);
            categories.push(category);
        }

        let mut running = false;
        for (task, category) in instance.tasks.iter().zip(&categories) {
            if *category == TaskCategory::InProgress {
                running = true;
                walk.unmet.push(UnmetEntry {
                    instance_id: instance.id,
                    condition: UnmetCondition::TaskStillRunning {
                        task_id: task.id,
                        task_name: task.name.clone(),
                        status: task.status.clone(),
                    },
                });
            }
        }
        if running {
            // Children of a running instance may not exist yet.
            return Ok(());
        }

        for (task, category) in instance.tasks.iter().zip(&categories) {
            if *category != TaskCategory::Failed {
                continue;
            }
            walk.saw_failed = true;
            let budget = retry_budget(task);
            if !budget.exhausted() {
                walk.unmet.push(UnmetEntry {
                    instance_id: instance.id,
                    condition: UnmetCondition::RetryBudgetRemaining {
                        task_id: task.id,
                        task_name: task.name.clone(),
                        retry_count: budget.used,
                        max_retries: budget.limit,
                    },
                });
            }
        }

        for task in instance.tasks.iter().filter(|t| t.is_sub_workflow()) {
            let Some(child_id) = task.child_instance_id else {
                debug!(
                    instance_id = instance.id,
                    task = %task.name,
                    "Sub-workflow task has no child instance"
                );
                continue;
            };

            let child = source
                .fetch_instance(child_id)
                .await
                .map_err(|source| ValidationError::Gateway {
                    instance_id: child_id,
                    source,
                })?;
            walk_instance(&child, source, depth + 1, max_depth, walk).await?;
        }

        Ok(())
    })
}
