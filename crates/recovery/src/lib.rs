//! Failure recovery monitor for DolphinScheduler workflows.
//!
//! The crate watches failed workflow instances, decides whether each one can
//! safely be resumed from its failed tasks, and asks the scheduler to do so.
//!
//! - [`classify`] maps raw scheduler statuses onto done / failed / in progress
//! - [`validator`] walks an instance and its sub-workflows to produce a verdict
//! - [`policy`] applies attempt limits, the time window and failure thresholds
//! - [`store`] keeps per-instance history in a JSON file
//! - [`gateway`] talks to the scheduler API
//! - [`monitor`] drives the periodic poll loop

pub mod classify;
pub mod config;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod policy;
pub mod store;
pub mod types;
pub mod validator;

pub use classify::{classify, TaskCategory, TaskStatus};
pub use config::Config;
pub use error::{
    ConfigError, GatewayError, MonitorError, StoreError, UnknownStatusError, ValidationError,
};
pub use gateway::{DolphinClient, DolphinConfig, ProjectScope, SchedulerGateway};
pub use monitor::{CycleReport, Monitor, MonitorOptions, MonitorStats, Outcome};
pub use policy::{Decision, NotifyReason, PolicyConfig, PolicyEngine, SkipReason};
pub use store::{DecisionKind, RecoveryRecord, RecoveryStore};
pub use types::{InstanceId, TaskKind, TaskRecord, TimeWindow, WorkflowInstance};
pub use validator::{validate, InstanceSource, ValidationVerdict};
