//! Access to the workflow scheduler.
//!
//! [`SchedulerGateway`] is the only seam between the decision logic and the
//! outside world. [`DolphinClient`] implements it over the DolphinScheduler
//! REST API; tests use in-memory implementations.

pub mod dolphin;

use async_trait::async_trait;

pub use dolphin::{DolphinClient, DolphinConfig};

use crate::error::GatewayError;
use crate::types::{
    DefinitionCode, InstanceId, Project, ProjectCode, TimeWindow, WorkflowDefinition,
    WorkflowInstance,
};
use crate::validator::InstanceSource;

#[async_trait]
pub trait SchedulerGateway: Send + Sync {
    /// Failed instances in `project` that started inside `window`, optionally
    /// limited to one definition. Returned instances are summaries without tasks.
    async fn list_instances(
        &self,
        project: ProjectCode,
        definition: Option<DefinitionCode>,
        window: TimeWindow,
    ) -> Result<Vec<WorkflowInstance>, GatewayError>;

    /// Full instance with tasks and resolved sub-workflow child ids.
    async fn get_instance(
        &self,
        project: ProjectCode,
        instance_id: InstanceId,
    ) -> Result<WorkflowInstance, GatewayError>;

    /// Re-run the failed tasks of an instance.
    async fn resume_instance(
        &self,
        project: ProjectCode,
        instance_id: InstanceId,
    ) -> Result<(), GatewayError>;

    async fn list_projects(&self) -> Result<Vec<Project>, GatewayError>;

    async fn list_definitions(
        &self,
        project: ProjectCode,
    ) -> Result<Vec<WorkflowDefinition>, GatewayError>;
}

/// Resolves child instances of one project through a gateway.
pub struct ProjectScope<'a, G: ?Sized> {
    gateway: &'a G,
    project: ProjectCode,
}

impl<'a, G: SchedulerGateway + ?Sized> ProjectScope<'a, G> {
    pub const fn new(gateway: &'a G, project: ProjectCode) -> Self {
        Self { gateway, project }
    }
}

#[async_trait]
impl<G: SchedulerGateway + ?Sized> InstanceSource for ProjectScope<'_, G> {
    async fn fetch_instance(&self, id: InstanceId) -> Result<WorkflowInstance, GatewayError> {
        self.gateway.get_instance(self.project, id).await
    }
}
