//! Poll loop controller.
//!
//! Each cycle walks the configured projects in order, lists failed instances
//! inside the time window, validates every candidate, asks the policy engine
//! for a decision and carries it out. Errors that concern a single instance
//! are logged and contained; an unauthorized token or a state-store failure
//! ends the loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{Notifier, NotifyEvent, WorkflowRef};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProjectConfig};
use crate::error::{GatewayError, MonitorError, ValidationError};
use crate::gateway::{ProjectScope, SchedulerGateway};
use crate::policy::{Decision, NotifyReason, PolicyEngine, SkipReason};
use crate::types::{InstanceId, ProjectCode, TimeWindow, WorkflowDefinition, WorkflowInstance};
use crate::validator::validate;

/// Loop timing and recursion settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub check_interval: Duration,
    pub continuous: bool,
    /// Pause after each successful resume
    pub recovery_interval: Duration,
    pub max_depth: usize,
}

impl MonitorOptions {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            check_interval: config.check_interval(),
            continuous: config.monitor.continuous_mode,
            recovery_interval: config.recovery_interval(),
            max_depth: config.monitor.max_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Active,
    Missing,
}

#[derive(Debug, Clone)]
struct MonitoredProject {
    config: ProjectConfig,
    code: Option<ProjectCode>,
    /// Allow-listed definitions; unused when monitoring everything.
    definitions: Vec<WorkflowDefinition>,
    status: ProjectStatus,
}

/// What happened to one instance during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Recovered { attempt: u32 },
    ResumeFailed { attempt: u32, error: String },
    NotifyOnly { reason: NotifyReason },
    Skipped { reason: SkipReason },
    Errored { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    pub project: String,
    pub instance_id: InstanceId,
    pub workflow: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result of one pass over all projects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub reports: Vec<InstanceReport>,
    /// Shutdown was requested before every candidate was handled.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn recovered(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Recovered { .. }))
    }

    pub fn notify_only(&self) -> usize {
        self.count(|o| matches!(o, Outcome::NotifyOnly { .. }))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Counters over the lifetime of a monitor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub instances_checked: u64,
    pub recoveries_triggered: u64,
    pub recoveries_failed: u64,
    pub notify_only: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl MonitorStats {
    fn record(&mut self, outcome: &Outcome) {
        self.instances_checked += 1;
        match outcome {
            Outcome::Recovered { .. } => self.recoveries_triggered += 1,
            Outcome::ResumeFailed { .. } => self.recoveries_failed += 1,
            Outcome::NotifyOnly { .. } => self.notify_only += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Errored { .. } => self.errors += 1,
        }
    }
}

pub struct Monitor<G: SchedulerGateway + ?Sized> {
    gateway: Arc<G>,
    policy: PolicyEngine,
    notifier: Arc<Notifier>,
    options: MonitorOptions,
    projects: Vec<MonitoredProject>,
    stats: MonitorStats,
}

impl<G: SchedulerGateway + ?Sized> Monitor<G> {
    pub fn new(
        gateway: Arc<G>,
        policy: PolicyEngine,
        notifier: Arc<Notifier>,
        options: MonitorOptions,
        projects: Vec<ProjectConfig>,
    ) -> Self {
        let projects = projects
            .into_iter()
            .map(|config| MonitoredProject {
                config,
                code: None,
                definitions: Vec::new(),
                status: ProjectStatus::Pending,
            })
            .collect();

        Self {
            gateway,
            policy,
            notifier,
            options,
            projects,
            stats: MonitorStats::default(),
        }
    }

    pub const fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub const fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn project_status(&self) -> Vec<(String, ProjectStatus)> {
        self.projects
            .iter()
            .map(|p| (p.config.name.clone(), p.status))
            .collect()
    }

    /// Map configured project and workflow names to scheduler codes.
    ///
    /// Only projects that are not active yet are looked up, so projects that
    /// resolved earlier keep their codes and allow-lists. Returns the number
    /// of active projects.
    pub async fn resolve_projects(&mut self) -> Result<usize, MonitorError> {
        let known = self.gateway.list_projects().await?;

        for project in self
            .projects
            .iter_mut()
            .filter(|p| p.status != ProjectStatus::Active)
        {
            let Some(found) = known.iter().find(|p| p.name == project.config.name) else {
                if project.status == ProjectStatus::Pending {
                    warn!(project = %project.config.name, "Project not found on scheduler");
                }
                project.status = ProjectStatus::Missing;
                continue;
            };
            project.code = Some(found.code);

            if !project.config.monitor_all {
                let definitions = self.gateway.list_definitions(found.code).await?;
                project.definitions = definitions
                    .into_iter()
                    .filter(|d| project.config.workflows.contains(&d.name))
                    .collect();

                for name in &project.config.workflows {
                    if !project.definitions.iter().any(|d| &d.name == name) {
                        warn!(
                            project = %project.config.name,
                            workflow = %name,
                            "Workflow not found in project"
                        );
                    }
                }
            }

            project.status = ProjectStatus::Active;
            info!(
                project = %project.config.name,
                code = found.code,
                monitor_all = project.config.monitor_all,
                workflows = project.definitions.len(),
                "Project resolved"
            );
        }

        let active = self
            .projects
            .iter()
            .filter(|p| p.status == ProjectStatus::Active)
            .count();
        if active == 0 {
            return Err(MonitorError::NoActiveProjects);
        }
        Ok(active)
    }

    /// Run cycles until shutdown, or a single cycle when not continuous.
    /// The store is flushed before returning, also on error.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<MonitorStats, MonitorError> {
        self.stats.started_at = Some(Utc::now());
        info!(
            projects = self.projects.len(),
            interval_secs = self.options.check_interval.as_secs(),
            continuous = self.options.continuous,
            "Recovery monitor started"
        );

        let result = self.run_cycles(&shutdown).await;
        let flushed = self.policy.store().flush().await;
        self.notifier.shutdown().await;

        if let Err(e) = &result {
            error!(error = %e, "Recovery monitor stopped on fatal error");
        }
        result?;
        flushed?;

        info!(
            cycles = self.stats.cycles,
            recoveries = self.stats.recoveries_triggered,
            failures = self.stats.recoveries_failed,
            errors = self.stats.errors,
            "Recovery monitor stopped"
        );
        Ok(self.stats.clone())
    }

    async fn run_cycles(&mut self, shutdown: &CancellationToken) -> Result<(), MonitorError> {
        loop {
            let report = self.check_once(shutdown).await?;
            info!(
                cycle = self.stats.cycles,
                candidates = report.reports.len(),
                recovered = report.recovered(),
                notify_only = report.notify_only(),
                "Check cycle complete"
            );

            if !self.options.continuous || shutdown.is_cancelled() {
                return Ok(());
            }
            if !pause(shutdown, self.options.check_interval).await {
                info!("Shutdown requested, leaving poll loop");
                return Ok(());
            }
        }
    }

    /// One pass over every active project.
    pub async fn check_once(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, MonitorError> {
        let mut report = CycleReport::default();
        self.stats.cycles += 1;
        self.stats.last_cycle_at = Some(Utc::now());

        if self.projects.iter().any(|p| p.status != ProjectStatus::Active) {
            match self.resolve_projects().await {
                Ok(_) => {}
                Err(MonitorError::Gateway(e)) if !e.is_fatal() => {
                    warn!(error = %e, "Could not resolve projects, retrying next cycle");
                    self.stats.errors += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for idx in 0..self.projects.len() {
            let project = self.projects[idx].clone();
            let Some(code) = project.code.filter(|_| project.status == ProjectStatus::Active)
            else {
                continue;
            };

            if shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let candidates = self.candidates(&project, code).await?;
            debug!(
                project = %project.config.name,
                candidates = candidates.len(),
                "Failed instances in window"
            );

            for summary in candidates {
                if shutdown.is_cancelled() {
                    report.interrupted = true;
                    break;
                }

                let instance_report = self
                    .evaluate(&project.config.name, code, summary.id, summary.started_at)
                    .await?;
                self.stats.record(&instance_report.outcome);

                let resumed = matches!(instance_report.outcome, Outcome::Recovered { .. });
                report.reports.push(instance_report);

                if resumed && !self.options.recovery_interval.is_zero() {
                    pause(shutdown, self.options.recovery_interval).await;
                }
            }
        }

        Ok(report)
    }

    /// Failed instances of `project` started inside the window, deduplicated.
    async fn candidates(
        &mut self,
        project: &MonitoredProject,
        code: ProjectCode,
    ) -> Result<Vec<WorkflowInstance>, MonitorError> {
        let window = self.policy.config().window_ending_at(Utc::now());

        let definitions: Vec<Option<&WorkflowDefinition>> = if project.config.monitor_all {
            vec![None]
        } else {
            project.definitions.iter().map(Some).collect()
        };

        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();

        for definition in definitions {
            let listed = match self
                .gateway
                .list_instances(code, definition.map(|d| d.code), window)
                .await
            {
                Ok(listed) => listed,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        project = %project.config.name,
                        workflow = definition.map_or("*", |d| d.name.as_str()),
                        error = %e,
                        "Failed to list instances"
                    );
                    self.stats.errors += 1;
                    continue;
                }
            };

            for instance in listed {
                if !in_window(&instance, &window) {
                    debug!(instance_id = instance.id, "Instance outside time window, ignoring");
                    continue;
                }
                if seen.insert(instance.id) {
                    candidates.push(instance);
                }
            }
        }

        Ok(candidates)
    }

    /// Validate one instance, decide, and act on the decision.
    ///
    /// Returns `Err` only for fatal conditions; everything else becomes an
    /// [`Outcome`].
    pub async fn evaluate(
        &self,
        project_name: &str,
        project: ProjectCode,
        instance_id: InstanceId,
        listed_start: Option<DateTime<Utc>>,
    ) -> Result<InstanceReport, MonitorError> {
        let mut instance = match self.gateway.get_instance(project, instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                return self
                    .contain_gateway_error(project_name, instance_id, String::new(), e)
                    .map(|outcome| report(project_name, instance_id, "", outcome));
            }
        };
        if instance.started_at.is_none() {
            instance.started_at = listed_start;
        }

        let workflow = workflow_ref(project_name, &instance);
        let source = ProjectScope::new(self.gateway.as_ref(), project);

        let verdict = match validate(&instance, &source, self.options.max_depth).await {
            Ok(verdict) => verdict,
            Err(ValidationError::Gateway { instance_id: child, source }) => {
                debug!(instance_id, child, "Sub-workflow fetch failed");
                return self
                    .contain_gateway_error(project_name, instance_id, instance.name.clone(), source)
                    .map(|outcome| report(project_name, instance_id, &instance.name, outcome));
            }
            Err(e) => {
                match &e {
                    ValidationError::DepthExceeded { .. } => {
                        error!(instance_id, error = %e, "Sub-workflow nesting too deep, skipping");
                    }
                    _ => warn!(instance_id, error = %e, "Validation failed, skipping"),
                }
                self.notifier.notify(NotifyEvent::ValidationFailed {
                    workflow,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Ok(report(
                    project_name,
                    instance_id,
                    &instance.name,
                    Outcome::Errored {
                        error: e.to_string(),
                    },
                ));
            }
        };

        let decision = self.policy.decide(&instance, &verdict, Utc::now()).await?;

        let outcome = match decision {
            Decision::Recover { attempt } => {
                self.resume(project, &instance, workflow, attempt).await?
            }
            Decision::NotifyOnly(reason) => {
                let record = self.policy.store().get(instance_id).await.unwrap_or_default();
                warn!(
                    instance_id,
                    workflow = %instance.name,
                    reason = %reason,
                    "Manual intervention required"
                );
                self.notifier.notify(NotifyEvent::ManualInterventionRequired {
                    workflow,
                    reason: reason.to_string(),
                    attempt_count: record.attempt_count,
                    failure_count: record.window_failure_count,
                    timestamp: Utc::now(),
                });
                Outcome::NotifyOnly { reason }
            }
            Decision::Skip(reason) => {
                debug!(instance_id, reason = %reason, "Skipping instance");
                Outcome::Skipped { reason }
            }
        };

        Ok(report(project_name, instance_id, &instance.name, outcome))
    }

    async fn resume(
        &self,
        project: ProjectCode,
        instance: &WorkflowInstance,
        workflow: WorkflowRef,
        attempt: u32,
    ) -> Result<Outcome, MonitorError> {
        let max_attempts = self.policy.config().max_recovery_attempts;

        match self.gateway.resume_instance(project, instance.id).await {
            Ok(()) => {
                self.policy.record_resume_outcome(instance.id, true).await?;
                info!(
                    instance_id = instance.id,
                    workflow = %instance.name,
                    attempt,
                    max_attempts,
                    "Recovery triggered"
                );
                self.notifier.notify(NotifyEvent::RecoveryTriggered {
                    workflow,
                    attempt,
                    max_attempts,
                    timestamp: Utc::now(),
                });
                Ok(Outcome::Recovered { attempt })
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                self.policy.record_resume_outcome(instance.id, false).await?;
                error!(
                    instance_id = instance.id,
                    workflow = %instance.name,
                    attempt,
                    error = %e,
                    "Resume call failed"
                );
                self.notifier.notify(NotifyEvent::RecoveryFailed {
                    workflow,
                    attempt,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(Outcome::ResumeFailed {
                    attempt,
                    error: e.to_string(),
                })
            }
        }
    }

    fn contain_gateway_error(
        &self,
        project_name: &str,
        instance_id: InstanceId,
        workflow: String,
        err: GatewayError,
    ) -> Result<Outcome, MonitorError> {
        if err.is_fatal() {
            return Err(err.into());
        }
        if err.is_transient() {
            warn!(project = %project_name, instance_id, workflow = %workflow, error = %err, "Scheduler unavailable, retrying next cycle");
        } else {
            warn!(project = %project_name, instance_id, workflow = %workflow, error = %err, "Skipping instance");
        }
        Ok(Outcome::Errored {
            error: err.to_string(),
        })
    }
}

fn in_window(instance: &WorkflowInstance, window: &TimeWindow) -> bool {
    instance.started_at.is_some_and(|t| window.contains(t))
}

fn workflow_ref(project: &str, instance: &WorkflowInstance) -> WorkflowRef {
    WorkflowRef {
        project: project.to_string(),
        workflow_name: instance.name.clone(),
        definition_code: instance.definition_code,
        instance_id: instance.id,
        started_at: instance.started_at,
    }
}

fn report(project: &str, instance_id: InstanceId, workflow: &str, outcome: Outcome) -> InstanceReport {
    InstanceReport {
        project: project.to_string(),
        instance_id,
        workflow: workflow.to_string(),
        outcome,
    }
}

/// Sleep for `duration` unless shutdown is requested first.
/// Returns `false` when interrupted.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
