//! Recovery policy: turns a verdict plus history into a decision.
//!
//! The engine itself is stateless. Each decision does a read-modify-write of
//! the instance's [`RecoveryRecord`], and a `Recover` decision is persisted
//! before it is returned so a crash between deciding and resuming can never
//! hand out an extra attempt.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{DecisionKind, RecoveryRecord, RecoveryStore};
use crate::types::{InstanceId, TimeWindow, WorkflowInstance};
use crate::validator::ValidationVerdict;

/// Limits the policy enforces. Built once from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyConfig {
    pub max_recovery_attempts: u32,
    pub time_window_hours: u32,
    pub max_failures_for_recovery: u32,
    pub auto_recovery_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            time_window_hours: 24,
            max_failures_for_recovery: 1,
            auto_recovery_enabled: true,
        }
    }
}

impl PolicyConfig {
    #[must_use]
    pub fn window_ending_at(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::ending_at(now, self.time_window_hours)
    }
}

/// Why an eligible instance is reported instead of resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotifyReason {
    AttemptsExhausted { attempts: u32, max: u32 },
    TooManyFailures { failures: u32, max: u32 },
    AutoRecoveryDisabled,
}

impl fmt::Display for NotifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptsExhausted { attempts, max } => {
                write!(f, "recovery attempts exhausted ({attempts}/{max})")
            }
            Self::TooManyFailures { failures, max } => {
                write!(f, "too many failures in time window ({failures} > {max})")
            }
            Self::AutoRecoveryDisabled => f.write_str("automatic recovery is disabled"),
        }
    }
}

/// Why an instance was left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NotRecoverable(String),
    OutsideTimeWindow,
    NoStartTime,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRecoverable(reason) => write!(f, "not recoverable: {reason}"),
            Self::OutsideTimeWindow => f.write_str("started outside the time window"),
            Self::NoStartTime => f.write_str("no start time reported"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Recover { attempt: u32 },
    NotifyOnly(NotifyReason),
    Skip(SkipReason),
}

impl Decision {
    #[must_use]
    pub const fn kind(&self) -> DecisionKind {
        match self {
            Self::Recover { .. } => DecisionKind::Recover,
            Self::NotifyOnly(_) => DecisionKind::NotifyOnly,
            Self::Skip(_) => DecisionKind::Skip,
        }
    }
}

/// Applies [`PolicyConfig`] against the history kept in a [`RecoveryStore`].
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: Arc<RecoveryStore>,
    config: PolicyConfig,
}

impl PolicyEngine {
    #[must_use]
    pub const fn new(store: Arc<RecoveryStore>, config: PolicyConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RecoveryStore> {
        &self.store
    }

    /// Decide what to do with `instance` given its verdict.
    ///
    /// Only the too-many-failures and recover branches write the store.
    pub async fn decide(
        &self,
        instance: &WorkflowInstance,
        verdict: &ValidationVerdict,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let config = &self.config;

        if !verdict.recoverable {
            debug!(instance_id = instance.id, reason = %verdict.reason, "Skipping: not recoverable");
            return Ok(Decision::Skip(SkipReason::NotRecoverable(
                verdict.reason.clone(),
            )));
        }

        let window = config.window_ending_at(now);
        match instance.started_at {
            None => return Ok(Decision::Skip(SkipReason::NoStartTime)),
            Some(started) if !window.contains(started) => {
                debug!(
                    instance_id = instance.id,
                    started_at = %started,
                    "Skipping: outside time window"
                );
                return Ok(Decision::Skip(SkipReason::OutsideTimeWindow));
            }
            Some(_) => {}
        }

        let existing = self.store.get(instance.id).await;
        let mut record = existing
            .clone()
            .unwrap_or_else(|| RecoveryRecord::new(&instance.name, instance.project_code));

        if record.attempt_count >= config.max_recovery_attempts {
            warn!(
                instance_id = instance.id,
                attempts = record.attempt_count,
                max = config.max_recovery_attempts,
                "Recovery attempts exhausted"
            );
            return Ok(Decision::NotifyOnly(NotifyReason::AttemptsExhausted {
                attempts: record.attempt_count,
                max: config.max_recovery_attempts,
            }));
        }

        let new_episode = existing
            .as_ref()
            .map_or(true, |r| r.last_decision == Some(DecisionKind::Recover));
        if new_episode {
            record.failure_timestamps.push(now);
        }
        record.window_failure_count = record.failures_within(&window);

        if record.window_failure_count > config.max_failures_for_recovery {
            let failures = record.window_failure_count;
            record.last_decision = Some(DecisionKind::NotifyOnly);
            record.updated_at = Some(now);
            self.store.upsert(instance.id, record).await?;

            warn!(
                instance_id = instance.id,
                failures,
                max = config.max_failures_for_recovery,
                "Too many failures in time window"
            );
            return Ok(Decision::NotifyOnly(NotifyReason::TooManyFailures {
                failures,
                max: config.max_failures_for_recovery,
            }));
        }

        if !config.auto_recovery_enabled {
            info!(instance_id = instance.id, "Eligible for recovery but auto recovery is disabled");
            return Ok(Decision::NotifyOnly(NotifyReason::AutoRecoveryDisabled));
        }

        record.attempt_count += 1;
        record.attempt_timestamps.push(now);
        record.last_decision = Some(DecisionKind::Recover);
        record.updated_at = Some(now);
        let attempt = record.attempt_count;
        self.store.upsert(instance.id, record).await?;

        info!(
            instance_id = instance.id,
            workflow = %instance.name,
            attempt,
            max = config.max_recovery_attempts,
            "Recovery approved"
        );
        Ok(Decision::Recover { attempt })
    }

    /// Record whether the resume call for `instance_id` was accepted.
    pub async fn record_resume_outcome(
        &self,
        instance_id: InstanceId,
        success: bool,
    ) -> Result<(), StoreError> {
        if !success {
            return Ok(());
        }
        let Some(mut record) = self.store.get(instance_id).await else {
            return Ok(());
        };
        record.successful_resumes += 1;
        self.store.upsert(instance_id, record).await
    }
}
