//! Poll loop tests against an in-memory scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use notify::{ChannelError, Notifier, NotifyChannel, NotifyEvent, RateLimiter};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use recovery::config::ProjectConfig;
use recovery::types::{DefinitionCode, Project, ProjectCode, WorkflowDefinition};
use recovery::{
    DecisionKind, GatewayError, InstanceId, Monitor, MonitorError, MonitorOptions, NotifyReason,
    Outcome, PolicyConfig, PolicyEngine, RecoveryStore, SchedulerGateway, TaskRecord, TimeWindow,
    WorkflowInstance,
};

const PROJECT: ProjectCode = 100;

#[derive(Default)]
struct StubGateway {
    projects: Vec<Project>,
    definitions: Vec<WorkflowDefinition>,
    instances: Mutex<HashMap<InstanceId, WorkflowInstance>>,
    broken: Mutex<HashMap<InstanceId, GatewayError>>,
    unauthorized: bool,
    /// `list_projects` answers with a transient error while set
    projects_down: Mutex<bool>,
    definition_calls: Mutex<usize>,
    resumed: Mutex<Vec<InstanceId>>,
    listed: Mutex<Vec<Option<DefinitionCode>>>,
}

impl StubGateway {
    fn new(instances: Vec<WorkflowInstance>) -> Self {
        Self {
            projects: vec![Project {
                code: PROJECT,
                name: "etl".to_string(),
            }],
            definitions: vec![
                WorkflowDefinition {
                    code: 1,
                    name: "daily-load".to_string(),
                },
                WorkflowDefinition {
                    code: 2,
                    name: "hourly-sync".to_string(),
                },
            ],
            instances: Mutex::new(instances.into_iter().map(|i| (i.id, i)).collect()),
            ..Self::default()
        }
    }

    fn resumed(&self) -> Vec<InstanceId> {
        self.resumed.lock().unwrap().clone()
    }

    fn add(&self, instance: WorkflowInstance) {
        self.instances.lock().unwrap().insert(instance.id, instance);
    }
}

#[async_trait]
impl SchedulerGateway for StubGateway {
    async fn list_instances(
        &self,
        project: ProjectCode,
        definition: Option<DefinitionCode>,
        _window: TimeWindow,
    ) -> Result<Vec<WorkflowInstance>, GatewayError> {
        self.listed.lock().unwrap().push(definition);
        let mut found: Vec<_> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.project_code == project && i.status == "FAILURE")
            .filter(|i| definition.map_or(true, |d| d == i.definition_code))
            .map(|i| WorkflowInstance {
                tasks: vec![],
                ..i.clone()
            })
            .collect();
        found.sort_by_key(|i| i.id);
        Ok(found)
    }

    async fn get_instance(
        &self,
        _project: ProjectCode,
        instance_id: InstanceId,
    ) -> Result<WorkflowInstance, GatewayError> {
        if let Some(err) = self.broken.lock().unwrap().get(&instance_id) {
            return Err(err.clone());
        }
        self.instances
            .lock()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("instance {instance_id}")))
    }

    async fn resume_instance(
        &self,
        _project: ProjectCode,
        instance_id: InstanceId,
    ) -> Result<(), GatewayError> {
        self.resumed.lock().unwrap().push(instance_id);
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, GatewayError> {
        if self.unauthorized {
            return Err(GatewayError::Unauthorized("bad token".to_string()));
        }
        if *self.projects_down.lock().unwrap() {
            return Err(GatewayError::Unreachable("connection refused".to_string()));
        }
        Ok(self.projects.clone())
    }

    async fn list_definitions(
        &self,
        _project: ProjectCode,
    ) -> Result<Vec<WorkflowDefinition>, GatewayError> {
        *self.definition_calls.lock().unwrap() += 1;
        Ok(self.definitions.clone())
    }
}

fn failed_instance(id: InstanceId, definition: DefinitionCode, tasks: Vec<TaskRecord>) -> WorkflowInstance {
    WorkflowInstance {
        id,
        name: format!("run-{id}"),
        definition_code: definition,
        project_code: PROJECT,
        status: "FAILURE".to_string(),
        started_at: Some(Utc::now() - ChronoDuration::minutes(30)),
        run_times: 1,
        tasks,
    }
}

fn exhausted() -> TaskRecord {
    TaskRecord::new(1, "load", "FAILURE").with_retries(2, 2)
}

fn options(continuous: bool) -> MonitorOptions {
    MonitorOptions {
        check_interval: Duration::from_millis(10),
        continuous,
        recovery_interval: Duration::ZERO,
        max_depth: 5,
    }
}

fn monitor_all() -> Vec<ProjectConfig> {
    vec![ProjectConfig {
        name: "etl".to_string(),
        workflows: vec![],
        monitor_all: true,
    }]
}

struct Harness {
    dir: TempDir,
    gateway: Arc<StubGateway>,
    store: Arc<RecoveryStore>,
    monitor: Monitor<StubGateway>,
}

/// Channel that takes a while to answer, like a real webhook.
struct SlowChannel {
    delivered: Mutex<Vec<NotifyEvent>>,
}

impl SlowChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn delivered(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl NotifyChannel for SlowChannel {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

async fn harness(
    gateway: StubGateway,
    policy: PolicyConfig,
    projects: Vec<ProjectConfig>,
    continuous: bool,
) -> Harness {
    harness_with(gateway, policy, projects, continuous, Notifier::disabled()).await
}

async fn harness_with(
    gateway: StubGateway,
    policy: PolicyConfig,
    projects: Vec<ProjectConfig>,
    continuous: bool,
    notifier: Notifier,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        RecoveryStore::open(dir.path().join("state.json"))
            .await
            .unwrap(),
    );
    let gateway = Arc::new(gateway);
    let monitor = Monitor::new(
        Arc::clone(&gateway),
        PolicyEngine::new(Arc::clone(&store), policy),
        Arc::new(notifier),
        options(continuous),
        projects,
    );
    Harness {
        dir,
        gateway,
        store,
        monitor,
    }
}

fn permissive() -> PolicyConfig {
    PolicyConfig {
        max_recovery_attempts: 3,
        time_window_hours: 24,
        max_failures_for_recovery: 10,
        auto_recovery_enabled: true,
    }
}

#[tokio::test]
async fn test_cycle_recovers_only_eligible_instances() {
    let gateway = StubGateway::new(vec![
        failed_instance(1, 1, vec![exhausted()]),
        failed_instance(2, 1, vec![TaskRecord::new(1, "load", "FAILURE").with_retries(0, 3)]),
        failed_instance(3, 2, vec![exhausted(), TaskRecord::new(2, "sub", "FAILURE").with_child(Some(30))]),
        WorkflowInstance {
            project_code: PROJECT,
            status: "RUNNING_EXECUTION".to_string(),
            ..failed_instance(30, 9, vec![TaskRecord::new(1, "inner", "RUNNING_EXECUTION")])
        },
    ]);
    let mut h = harness(gateway, permissive(), monitor_all(), false).await;

    let report = h.monitor.check_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.reports.len(), 3);
    assert_eq!(report.recovered(), 1);
    assert_eq!(h.gateway.resumed(), vec![1]);

    let record = h.store.get(1).await.unwrap();
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.successful_resumes, 1);
    assert_eq!(record.last_decision, Some(DecisionKind::Recover));

    // not-recoverable instances leave no history behind
    assert_eq!(h.store.get(2).await, None);
    assert_eq!(h.store.get(3).await, None);
}

#[tokio::test]
async fn test_attempts_exhaust_across_cycles() {
    let gateway = StubGateway::new(vec![failed_instance(7, 1, vec![exhausted()])]);
    let mut h = harness(gateway, permissive(), monitor_all(), false).await;
    let token = CancellationToken::new();

    for _ in 0..3 {
        let report = h.monitor.check_once(&token).await.unwrap();
        assert_eq!(report.recovered(), 1);
    }

    let report = h.monitor.check_once(&token).await.unwrap();
    assert_eq!(
        report.reports[0].outcome,
        Outcome::NotifyOnly {
            reason: NotifyReason::AttemptsExhausted { attempts: 3, max: 3 }
        }
    );
    assert_eq!(h.gateway.resumed(), vec![7, 7, 7]);
    assert_eq!(h.monitor.stats().recoveries_triggered, 3);
    assert_eq!(h.monitor.stats().notify_only, 1);
}

#[tokio::test]
async fn test_auto_recovery_disabled_never_resumes() {
    let gateway = StubGateway::new(vec![failed_instance(1, 1, vec![exhausted()])]);
    let policy = PolicyConfig {
        auto_recovery_enabled: false,
        ..permissive()
    };
    let mut h = harness(gateway, policy, monitor_all(), false).await;

    let report = h.monitor.check_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.notify_only(), 1);
    assert!(h.gateway.resumed().is_empty());
    assert_eq!(h.store.get(1).await.map(|r| r.attempt_count).unwrap_or(0), 0);
}

#[tokio::test]
async fn test_old_instances_are_ignored() {
    let mut old = failed_instance(1, 1, vec![exhausted()]);
    old.started_at = Some(Utc::now() - ChronoDuration::hours(30));
    let mut h = harness(StubGateway::new(vec![old]), permissive(), monitor_all(), false).await;

    let report = h.monitor.check_once(&CancellationToken::new()).await.unwrap();

    assert!(report.reports.is_empty());
    assert!(h.gateway.resumed().is_empty());
}

#[tokio::test]
async fn test_transient_errors_are_contained_to_one_instance() {
    let gateway = StubGateway::new(vec![
        failed_instance(1, 1, vec![exhausted()]),
        failed_instance(2, 1, vec![exhausted()]),
        failed_instance(3, 1, vec![TaskRecord::new(1, "odd", "MELTED")]),
    ]);
    gateway
        .broken
        .lock()
        .unwrap()
        .insert(1, GatewayError::Timeout("slow".to_string()));
    let mut h = harness(gateway, permissive(), monitor_all(), false).await;

    let report = h.monitor.check_once(&CancellationToken::new()).await.unwrap();

    assert!(matches!(report.reports[0].outcome, Outcome::Errored { .. }));
    assert!(matches!(report.reports[1].outcome, Outcome::Recovered { attempt: 1 }));
    assert!(matches!(report.reports[2].outcome, Outcome::Errored { .. }));
    assert_eq!(h.gateway.resumed(), vec![2]);
    assert_eq!(h.monitor.stats().errors, 2);
}

#[tokio::test]
async fn test_unauthorized_is_fatal() {
    let gateway = StubGateway {
        unauthorized: true,
        ..StubGateway::new(vec![])
    };
    let mut h = harness(gateway, permissive(), monitor_all(), true).await;

    let err = h.monitor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MonitorError::Gateway(GatewayError::Unauthorized(_))));
}

#[tokio::test]
async fn test_unknown_projects_stop_the_monitor() {
    let projects = vec![ProjectConfig {
        name: "nope".to_string(),
        workflows: vec![],
        monitor_all: true,
    }];
    let mut h = harness(StubGateway::new(vec![]), permissive(), projects, false).await;

    let err = h.monitor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MonitorError::NoActiveProjects));
}

#[tokio::test]
async fn test_allow_list_limits_definitions() {
    let gateway = StubGateway::new(vec![
        failed_instance(1, 1, vec![exhausted()]),
        failed_instance(2, 2, vec![exhausted()]),
    ]);
    let projects = vec![ProjectConfig {
        name: "etl".to_string(),
        workflows: vec!["hourly-sync".to_string()],
        monitor_all: false,
    }];
    let mut h = harness(gateway, permissive(), projects, false).await;

    h.monitor.check_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(*h.gateway.listed.lock().unwrap(), vec![Some(2)]);
    assert_eq!(h.gateway.resumed(), vec![2]);
}

#[tokio::test]
async fn test_cancelled_token_stops_before_work() {
    let gateway = StubGateway::new(vec![failed_instance(1, 1, vec![exhausted()])]);
    let mut h = harness(gateway, permissive(), monitor_all(), true).await;

    let token = CancellationToken::new();
    token.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(5), h.monitor.run(token))
        .await
        .expect("monitor should stop promptly")
        .unwrap();

    assert_eq!(stats.cycles, 1);
    assert!(h.gateway.resumed().is_empty());
}

#[tokio::test]
async fn test_shutdown_interrupts_interval_sleep() {
    let gateway = StubGateway::new(vec![]);
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RecoveryStore::open(dir.path().join("s.json")).await.unwrap());
    let mut monitor = Monitor::new(
        Arc::new(gateway),
        PolicyEngine::new(store, permissive()),
        Arc::new(Notifier::disabled()),
        MonitorOptions {
            check_interval: Duration::from_secs(3600),
            ..options(true)
        },
        monitor_all(),
    );

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let stats = tokio::time::timeout(Duration::from_secs(5), monitor.run(token))
        .await
        .expect("sleep should be interrupted")
        .unwrap();
    assert_eq!(stats.cycles, 1);
    assert!(dir.path().join("s.json").exists(), "store flushed on exit");
}

#[tokio::test]
async fn test_single_cycle_delivers_notifications_before_returning() {
    let gateway = StubGateway::new(vec![
        failed_instance(1, 1, vec![exhausted()]),
        failed_instance(2, 2, vec![exhausted()]),
    ]);
    let channel = SlowChannel::new();
    let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>]);
    let mut h = harness_with(gateway, permissive(), monitor_all(), false, notifier).await;

    let stats = h.monitor.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.recoveries_triggered, 2);
    assert_eq!(channel.delivered(), 2);
}

#[tokio::test]
async fn test_notifications_are_limited_per_definition() {
    // three runs of definition 1 and one of definition 2
    let gateway = StubGateway::new(vec![
        failed_instance(1, 1, vec![exhausted()]),
        failed_instance(2, 1, vec![exhausted()]),
        failed_instance(3, 1, vec![exhausted()]),
        failed_instance(4, 2, vec![exhausted()]),
    ]);
    let channel = SlowChannel::new();
    let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>])
        .with_rate_limit(RateLimiter::new(1, 24));
    let mut h = harness_with(gateway, permissive(), monitor_all(), false, notifier).await;

    h.monitor.run(CancellationToken::new()).await.unwrap();

    assert_eq!(h.gateway.resumed(), vec![1, 2, 3, 4]);
    let delivered = channel.delivered.lock().unwrap();
    let mut ids: Vec<_> = delivered.iter().map(|e| e.workflow().instance_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 4]);
}

#[tokio::test]
async fn test_store_write_failure_halts_the_loop() {
    let gateway = StubGateway::new(vec![failed_instance(1, 1, vec![exhausted()])]);
    let mut h = harness(gateway, permissive(), monitor_all(), true).await;

    // a non-empty directory at the state path makes every write fail
    let state = h.dir.path().join("state.json");
    std::fs::create_dir(&state).unwrap();
    std::fs::write(state.join("occupied"), "x").unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), h.monitor.run(CancellationToken::new()))
        .await
        .expect("store failure should end the loop")
        .unwrap_err();

    assert!(matches!(err, MonitorError::Store(_)));
    assert!(h.gateway.resumed().is_empty(), "no resume without a persisted attempt");
    assert_eq!(h.store.get(1).await, None);
}

#[tokio::test]
async fn test_missing_instances_skip_only_themselves() {
    let gateway = StubGateway::new(vec![
        failed_instance(1, 1, vec![exhausted()]),
        failed_instance(
            2,
            1,
            vec![exhausted(), TaskRecord::new(2, "sub", "FAILURE").with_child(Some(99))],
        ),
        failed_instance(3, 1, vec![exhausted()]),
    ]);
    gateway
        .broken
        .lock()
        .unwrap()
        .insert(1, GatewayError::NotFound("instance 1".to_string()));
    let mut h = harness(gateway, permissive(), monitor_all(), false).await;

    let report = h.monitor.check_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.reports.len(), 3);
    assert!(matches!(report.reports[0].outcome, Outcome::Errored { .. }));
    assert!(matches!(report.reports[1].outcome, Outcome::Errored { .. }));
    assert!(matches!(report.reports[2].outcome, Outcome::Recovered { attempt: 1 }));
    assert_eq!(h.gateway.resumed(), vec![3]);
    assert_eq!(h.store.get(1).await, None);
    assert_eq!(h.store.get(2).await, None);
}

#[tokio::test]
async fn test_resolved_projects_keep_polling_while_others_are_missing() {
    let gateway = StubGateway::new(vec![failed_instance(1, 1, vec![exhausted()])]);
    let projects = vec![
        ProjectConfig {
            name: "etl".to_string(),
            workflows: vec!["daily-load".to_string()],
            monitor_all: false,
        },
        ProjectConfig {
            name: "ghost".to_string(),
            workflows: vec![],
            monitor_all: true,
        },
    ];
    let mut h = harness(gateway, permissive(), projects, false).await;
    let token = CancellationToken::new();

    let first = h.monitor.check_once(&token).await.unwrap();
    assert_eq!(first.recovered(), 1);

    // the scheduler stops answering project lookups; etl is already resolved
    *h.gateway.projects_down.lock().unwrap() = true;
    h.gateway.add(failed_instance(2, 1, vec![exhausted()]));

    let second = h.monitor.check_once(&token).await.unwrap();

    assert_eq!(second.recovered(), 2);
    assert_eq!(h.gateway.resumed(), vec![1, 1, 2]);
    assert_eq!(*h.gateway.definition_calls.lock().unwrap(), 1);
    assert_eq!(h.monitor.stats().errors, 1);
}
