//! DolphinScheduler REST client.
//!
//! Every endpoint answers with an envelope `{ "code": 0, "msg": "...", "data": ... }`
//! where a non-zero code is an application-level error. Timestamps are plain
//! `YYYY-MM-DD HH:MM:SS` strings in the scheduler's local time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::SchedulerGateway;
use crate::error::GatewayError;
use crate::types::{
    DefinitionCode, InstanceId, Project, ProjectCode, TaskKind, TaskRecord, TimeWindow,
    WorkflowDefinition, WorkflowInstance,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Execute type that re-runs only the failed tasks of an instance.
const RESUME_EXECUTE_TYPE: &str = "START_FAILURE_TASK_PROCESS";

/// Upper bound on pages fetched by one listing call.
const MAX_PAGES: u32 = 100;

/// Connection settings for [`DolphinClient`].
#[derive(Debug, Clone)]
pub struct DolphinConfig {
    /// Base URL including the context path, e.g. `http://ds:12345/dolphinscheduler`
    pub api_url: String,
    /// API token sent in the `token` header
    pub token: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Offset of the scheduler's local time from UTC
    pub utc_offset_hours: i32,
    /// Page size for listing calls
    pub page_size: u32,
}

impl Default for DolphinConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:12345/dolphinscheduler".to_string(),
            token: String::new(),
            timeout_secs: 30,
            utc_offset_hours: 8,
            page_size: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    total_list: Vec<T>,
    #[serde(default)]
    total_page: u32,
}

#[derive(Debug, Deserialize)]
struct ProjectDto {
    code: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DefinitionDto {
    code: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceDto {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    process_definition_code: u64,
    #[serde(default)]
    state: Value,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    run_times: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDto {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    task_type: String,
    #[serde(default)]
    state: Value,
    #[serde(default)]
    retry_times: u32,
    #[serde(default)]
    max_retry_times: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskListDto {
    #[serde(default, alias = "totalList")]
    task_list: Vec<TaskDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubInstanceDto {
    #[serde(default, alias = "id")]
    sub_process_instance_id: Option<u64>,
}

/// [`SchedulerGateway`] over the DolphinScheduler REST API.
#[derive(Debug, Clone)]
pub struct DolphinClient {
    config: DolphinConfig,
    offset: FixedOffset,
    client: reqwest::Client,
}

impl DolphinClient {
    pub fn new(config: DolphinConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).ok_or_else(|| {
            GatewayError::Decode(format!("invalid UTC offset {}h", config.utc_offset_hours))
        })?;

        Ok(Self {
            config,
            offset,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        debug!(path, "GET scheduler API");
        let response = self
            .client
            .get(self.url(path))
            .header("token", &self.config.token)
            .query(query)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        debug!(path, "POST scheduler API");
        let response = self
            .client
            .post(self.url(path))
            .header("token", &self.config.token)
            .form(form)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn decode<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::Unauthorized(format!("{path}: HTTP {status}")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Unreachable(format!(
                "{path}: HTTP {status}: {body}"
            )));
        }

        let envelope: Envelope = response.json().await?;
        if envelope.code != 0 {
            return Err(GatewayError::Api {
                code: envelope.code,
                message: envelope.msg.unwrap_or_default(),
            });
        }

        serde_json::from_value(envelope.data)
            .map_err(|e| GatewayError::Decode(format!("{path}: {e}")))
    }

    async fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, GatewayError> {
        let mut items = Vec::new();
        let mut page_no = 1;

        loop {
            let mut params = query.to_vec();
            params.push(("pageNo", page_no.to_string()));
            params.push(("pageSize", self.config.page_size.to_string()));

            let page: Page<T> = self.get(path, &params).await?;
            let fetched = page.total_list.len();
            items.extend(page.total_list);

            if fetched == 0 || page_no >= page.total_page {
                break;
            }
            if page_no >= MAX_PAGES {
                warn!(path, pages = MAX_PAGES, "Page limit reached, result truncated");
                break;
            }
            page_no += 1;
        }

        Ok(items)
    }

    fn format_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format(TIME_FORMAT).to_string()
    }

    fn instance_from_dto(&self, project: ProjectCode, dto: InstanceDto) -> WorkflowInstance {
        let started_at = dto
            .start_time
            .as_deref()
            .and_then(|raw| parse_time(raw, self.offset));

        WorkflowInstance {
            id: dto.id,
            name: dto.name,
            definition_code: dto.process_definition_code,
            project_code: project,
            status: status_string(&dto.state),
            started_at,
            run_times: dto.run_times,
            tasks: Vec::new(),
        }
    }

    /// Child instance started by a sub-workflow task, if any.
    async fn sub_instance_of(
        &self,
        project: ProjectCode,
        task_id: u64,
    ) -> Result<Option<InstanceId>, GatewayError> {
        let path = format!("/projects/{project}/process-instances/query-sub-by-parent");
        match self
            .get::<SubInstanceDto>(&path, &[("taskId", task_id.to_string())])
            .await
        {
            Ok(dto) => Ok(dto.sub_process_instance_id),
            Err(GatewayError::NotFound(_) | GatewayError::Api { .. }) => {
                debug!(task_id, "No child instance for sub-workflow task");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SchedulerGateway for DolphinClient {
    async fn list_instances(
        &self,
        project: ProjectCode,
        definition: Option<DefinitionCode>,
        window: TimeWindow,
    ) -> Result<Vec<WorkflowInstance>, GatewayError> {
        let path = format!("/projects/{project}/process-instances");
        let mut query = vec![
            ("stateType", "FAILURE".to_string()),
            ("startDate", self.format_time(window.start)),
            ("endDate", self.format_time(window.end)),
        ];
        if let Some(code) = definition {
            query.push(("processDefineCode", code.to_string()));
        }

        let dtos: Vec<InstanceDto> = self.get_paged(&path, &query).await?;
        Ok(dtos
            .into_iter()
            .map(|dto| self.instance_from_dto(project, dto))
            .collect())
    }

    async fn get_instance(
        &self,
        project: ProjectCode,
        instance_id: InstanceId,
    ) -> Result<WorkflowInstance, GatewayError> {
        let dto: InstanceDto = self
            .get(
                &format!("/projects/{project}/process-instances/{instance_id}"),
                &[],
            )
            .await?;
        let mut instance = self.instance_from_dto(project, dto);

        let tasks: TaskListDto = self
            .get(
                &format!("/projects/{project}/process-instances/{instance_id}/tasks"),
                &[],
            )
            .await?;

        for task in tasks.task_list {
            let kind = TaskKind::from_task_type(&task.task_type);
            let child_instance_id = match kind {
                TaskKind::SubWorkflow => self.sub_instance_of(project, task.id).await?,
                TaskKind::Ordinary => None,
            };
            instance.tasks.push(TaskRecord {
                id: task.id,
                name: task.name,
                kind,
                status: status_string(&task.state),
                retry_count: task.retry_times,
                max_retries: task.max_retry_times,
                child_instance_id,
            });
        }

        Ok(instance)
    }

    async fn resume_instance(
        &self,
        project: ProjectCode,
        instance_id: InstanceId,
    ) -> Result<(), GatewayError> {
        let path = format!("/projects/{project}/executors/execute");
        let _: Value = self
            .post_form(
                &path,
                &[
                    ("processInstanceId", instance_id.to_string()),
                    ("executeType", RESUME_EXECUTE_TYPE.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, GatewayError> {
        let projects: Vec<ProjectDto> = self.get("/projects/list", &[]).await?;
        Ok(projects
            .into_iter()
            .map(|p| Project {
                code: p.code,
                name: p.name,
            })
            .collect())
    }

    async fn list_definitions(
        &self,
        project: ProjectCode,
    ) -> Result<Vec<WorkflowDefinition>, GatewayError> {
        let path = format!("/projects/{project}/process-definition");
        let definitions: Vec<DefinitionDto> = self.get_paged(&path, &[]).await?;
        Ok(definitions
            .into_iter()
            .map(|d| WorkflowDefinition {
                code: d.code,
                name: d.name,
            })
            .collect())
    }
}

/// Status fields are names in newer releases and ordinals in older ones.
fn status_string(state: &Value) -> String {
    match state {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a scheduler timestamp, either RFC 3339 or local `YYYY-MM-DD HH:MM:SS`.
pub fn parse_time(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT).ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
