//! Notification event types for workflow recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for recovery notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - recovery proceeding normally
    Info,
    /// Warning - automatic recovery stopped, somebody should look
    Warning,
    /// Critical - recovery itself failed
    Critical,
}

impl Severity {
    /// Marker prepended to message titles.
    #[must_use]
    pub const fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "✅",
            Self::Warning => "⚠️",
            Self::Critical => "❌",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// The workflow instance an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    /// Project name as configured
    pub project: String,
    /// Workflow instance name
    pub workflow_name: String,
    /// Code of the workflow definition the instance was started from
    pub definition_code: u64,
    /// Workflow instance id
    pub instance_id: u64,
    /// When the instance started, if the scheduler reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A resume-from-failure command was accepted by the scheduler
    RecoveryTriggered {
        workflow: WorkflowRef,
        attempt: u32,
        max_attempts: u32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The resume command was rejected or could not be delivered
    RecoveryFailed {
        workflow: WorkflowRef,
        attempt: u32,
        error: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The instance is eligible but the policy refused to recover it automatically
    ManualInterventionRequired {
        workflow: WorkflowRef,
        reason: String,
        attempt_count: u32,
        failure_count: u32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The instance could not be validated (unknown status, cyclic sub-workflows)
    ValidationFailed {
        workflow: WorkflowRef,
        error: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::RecoveryTriggered { workflow, .. } => {
                format!("Recovery triggered: {}", workflow.workflow_name)
            }
            Self::RecoveryFailed { workflow, .. } => {
                format!("Recovery failed: {}", workflow.workflow_name)
            }
            Self::ManualInterventionRequired { workflow, .. } => {
                format!("Manual intervention required: {}", workflow.workflow_name)
            }
            Self::ValidationFailed { workflow, .. } => {
                format!("Validation error: {}", workflow.workflow_name)
            }
        }
    }

    /// Human readable body of the message.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::RecoveryTriggered {
                attempt,
                max_attempts,
                ..
            } => format!(
                "Resumed from the failed node (attempt {attempt}/{max_attempts}); the workflow is running again."
            ),
            Self::RecoveryFailed { error, .. } => {
                format!("The scheduler did not accept the resume command: {error}")
            }
            Self::ManualInterventionRequired { reason, .. } => {
                format!("Automatic recovery is paused for this instance: {reason}")
            }
            Self::ValidationFailed { error, .. } => {
                format!("The instance was skipped this cycle: {error}")
            }
        }
    }

    /// Extra key/value details rendered under the body.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, String)> {
        let workflow = self.workflow();
        let mut fields = vec![
            ("Project".to_string(), workflow.project.clone()),
            ("Workflow".to_string(), workflow.workflow_name.clone()),
            ("Instance ID".to_string(), workflow.instance_id.to_string()),
        ];
        if let Some(started_at) = workflow.started_at {
            fields.push((
                "Started".to_string(),
                started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ));
        }

        match self {
            Self::RecoveryTriggered { attempt, .. } | Self::RecoveryFailed { attempt, .. } => {
                fields.push(("Attempt".to_string(), attempt.to_string()));
            }
            Self::ManualInterventionRequired {
                attempt_count,
                failure_count,
                ..
            } => {
                fields.push(("Recovery attempts".to_string(), attempt_count.to_string()));
                fields.push(("Failures in window".to_string(), failure_count.to_string()));
            }
            Self::ValidationFailed { .. } => {}
        }

        fields
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RecoveryTriggered { .. } => Severity::Info,
            Self::ManualInterventionRequired { .. } | Self::ValidationFailed { .. } => {
                Severity::Warning
            }
            Self::RecoveryFailed { .. } => Severity::Critical,
        }
    }

    /// The workflow instance this event refers to.
    #[must_use]
    pub const fn workflow(&self) -> &WorkflowRef {
        match self {
            Self::RecoveryTriggered { workflow, .. }
            | Self::RecoveryFailed { workflow, .. }
            | Self::ManualInterventionRequired { workflow, .. }
            | Self::ValidationFailed { workflow, .. } => workflow,
        }
    }

    /// Key used for rate limiting: one bucket per project and workflow
    /// definition. Instance names change on every run, definition codes don't.
    #[must_use]
    pub fn rate_key(&self) -> String {
        let workflow = self.workflow();
        format!("{}/{}", workflow.project, workflow.definition_code)
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RecoveryTriggered { timestamp, .. }
            | Self::RecoveryFailed { timestamp, .. }
            | Self::ManualInterventionRequired { timestamp, .. }
            | Self::ValidationFailed { timestamp, .. } => *timestamp,
        }
    }
}
