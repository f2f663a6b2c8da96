//! Configuration: a YAML file, overridden by `DS_*` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::gateway::DolphinConfig;
use crate::policy::PolicyConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dolphinscheduler: SchedulerSection,
    pub monitor: MonitorSection,
    pub retry: RetrySection,
    pub logging: LoggingSection,
    pub state: StateSection,
    pub notification: NotificationSection,
    /// Project name to workflow allow-list. A bare `name:` entry monitors everything.
    pub projects: BTreeMap<String, Option<ProjectEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub api_url: String,
    pub token: String,
    pub timeout_secs: u64,
    /// Offset of the scheduler's local clock from UTC, in hours
    pub utc_offset_hours: i32,
    pub page_size: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let dolphin = DolphinConfig::default();
        Self {
            api_url: dolphin.api_url,
            token: dolphin.token,
            timeout_secs: dolphin.timeout_secs,
            utc_offset_hours: dolphin.utc_offset_hours,
            page_size: dolphin.page_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    /// Seconds between poll cycles
    pub check_interval: u64,
    /// Keep polling; `false` runs a single cycle
    pub continuous_mode: bool,
    pub time_window_hours: u32,
    pub max_failures_for_recovery: u32,
    /// Sub-workflow nesting limit
    pub max_depth: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            check_interval: 60,
            continuous_mode: true,
            time_window_hours: 24,
            max_failures_for_recovery: 1,
            max_depth: crate::validator::DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_recovery_attempts: u32,
    /// Seconds to pause after a resume before looking at the next instance
    pub recovery_interval: u64,
    pub auto_recovery: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            recovery_interval: 30,
            auto_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub path: PathBuf,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/recovery_state.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub dingtalk: DingTalkSection,
    pub wework: WeWorkSection,
    pub email: EmailSection,
    pub rate_limit: RateLimitSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DingTalkSection {
    pub webhook_url: String,
    /// Security keyword configured on the robot
    pub keyword: Option<String>,
    /// Signing secret for robots using signature security
    pub secret: Option<String>,
    pub at_mobiles: Vec<String>,
    pub at_all: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeWorkSection {
    pub webhook_url: String,
    /// User ids to mention, `@all` for everybody
    pub mentioned_list: Vec<String>,
    pub mentioned_mobile_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSection {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    /// Implicit TLS; `false` uses STARTTLS
    pub use_ssl: bool,
}

impl Default for EmailSection {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 465,
            username: String::new(),
            password: String::new(),
            from_addr: String::new(),
            to_addrs: Vec::new(),
            use_ssl: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Per workflow definition; 0 disables rate limiting
    pub max_notifications: usize,
    pub window_hours: u32,
    /// Send history, kept across runs
    pub path: PathBuf,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_notifications: 10,
            window_hours: 1,
            path: PathBuf::from("data/notification_rate_limit.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectEntry {
    pub workflows: Vec<String>,
    pub monitor_all: Option<bool>,
}

/// A project to monitor, with its allow-list resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: String,
    pub workflows: Vec<String>,
    pub monitor_all: bool,
}

impl Config {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse `path` without overrides. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Apply `DS_*` overrides, reading variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DS_API_URL") {
            self.dolphinscheduler.api_url = v;
        }
        if let Some(v) = get("DS_TOKEN") {
            self.dolphinscheduler.token = v;
        }
        if let Some(v) = get("DS_CHECK_INTERVAL") {
            self.monitor.check_interval = parse_var("DS_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = get("DS_CONTINUOUS_MODE") {
            self.monitor.continuous_mode = parse_bool("DS_CONTINUOUS_MODE", &v)?;
        }
        if let Some(v) = get("DS_TIME_WINDOW_HOURS") {
            self.monitor.time_window_hours = parse_var("DS_TIME_WINDOW_HOURS", &v)?;
        }
        if let Some(v) = get("DS_MAX_FAILURES_FOR_RECOVERY") {
            self.monitor.max_failures_for_recovery =
                parse_var("DS_MAX_FAILURES_FOR_RECOVERY", &v)?;
        }
        if let Some(v) = get("DS_MAX_RECOVERY_ATTEMPTS") {
            self.retry.max_recovery_attempts = parse_var("DS_MAX_RECOVERY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("DS_AUTO_RECOVERY") {
            self.retry.auto_recovery = parse_bool("DS_AUTO_RECOVERY", &v)?;
        }
        if let Some(v) = get("DS_LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some(v) = get("DS_STATE_FILE") {
            self.state.path = PathBuf::from(v);
        }
        if let Some(v) = get("DS_DINGTALK_WEBHOOK") {
            self.notification.dingtalk.webhook_url = v;
        }
        if let Some(v) = get("DS_DINGTALK_KEYWORD") {
            self.notification.dingtalk.keyword = Some(v);
        }
        if let Some(v) = get("DS_DINGTALK_SECRET") {
            self.notification.dingtalk.secret = Some(v);
        }
        if let Some(v) = get("DS_WEWORK_WEBHOOK") {
            self.notification.wework.webhook_url = v;
        }
        if let Some(v) = get("DS_RATE_LIMIT_STATE_FILE") {
            self.notification.rate_limit.path = PathBuf::from(v);
        }

        let email = &mut self.notification.email;
        if let Some(v) = get("DS_EMAIL_ENABLED") {
            email.enabled = parse_bool("DS_EMAIL_ENABLED", &v)?;
        }
        if let Some(v) = get("DS_EMAIL_SMTP_HOST") {
            email.smtp_host = v;
        }
        if let Some(v) = get("DS_EMAIL_SMTP_PORT") {
            email.smtp_port = parse_var("DS_EMAIL_SMTP_PORT", &v)?;
        }
        if let Some(v) = get("DS_EMAIL_USERNAME") {
            email.username = v;
        }
        if let Some(v) = get("DS_EMAIL_PASSWORD") {
            email.password = v;
        }
        if let Some(v) = get("DS_EMAIL_FROM") {
            email.from_addr = v;
        }
        if let Some(v) = get("DS_EMAIL_TO") {
            email.to_addrs = v
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.dolphinscheduler.api_url.trim().is_empty() {
            return invalid("dolphinscheduler.api_url must be set");
        }
        if self.dolphinscheduler.token.trim().is_empty() {
            return invalid("dolphinscheduler.token must be set (or DS_TOKEN)");
        }
        if self.dolphinscheduler.timeout_secs == 0 {
            return invalid("dolphinscheduler.timeout_secs must be positive");
        }
        if !(-12..=14).contains(&self.dolphinscheduler.utc_offset_hours) {
            return invalid("dolphinscheduler.utc_offset_hours must be between -12 and 14");
        }
        if self.dolphinscheduler.page_size == 0 {
            return invalid("dolphinscheduler.page_size must be positive");
        }
        if self.monitor.check_interval == 0 {
            return invalid("monitor.check_interval must be positive");
        }
        if self.monitor.time_window_hours == 0 {
            return invalid("monitor.time_window_hours must be positive");
        }
        if self.monitor.max_depth == 0 {
            return invalid("monitor.max_depth must be positive");
        }
        if self.retry.max_recovery_attempts == 0 {
            return invalid("retry.max_recovery_attempts must be positive");
        }
        let email = &self.notification.email;
        if email.enabled
            && (email.smtp_host.is_empty() || email.from_addr.is_empty() || email.to_addrs.is_empty())
        {
            return invalid("notification.email needs smtp_host, from_addr and to_addrs when enabled");
        }
        Ok(())
    }

    #[must_use]
    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            max_recovery_attempts: self.retry.max_recovery_attempts,
            time_window_hours: self.monitor.time_window_hours,
            max_failures_for_recovery: self.monitor.max_failures_for_recovery,
            auto_recovery_enabled: self.retry.auto_recovery,
        }
    }

    #[must_use]
    pub fn dolphin(&self) -> DolphinConfig {
        DolphinConfig {
            api_url: self.dolphinscheduler.api_url.clone(),
            token: self.dolphinscheduler.token.clone(),
            timeout_secs: self.dolphinscheduler.timeout_secs,
            utc_offset_hours: self.dolphinscheduler.utc_offset_hours,
            page_size: self.dolphinscheduler.page_size,
        }
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.check_interval)
    }

    #[must_use]
    pub const fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.retry.recovery_interval)
    }

    /// Configured projects with their allow-lists resolved. When
    /// `monitor_all` is not given it defaults to "no allow-list present".
    #[must_use]
    pub fn project_list(&self) -> Vec<ProjectConfig> {
        self.projects
            .iter()
            .map(|(name, entry)| {
                let entry = entry.clone().unwrap_or_default();
                let monitor_all = entry.monitor_all.unwrap_or(entry.workflows.is_empty());
                ProjectConfig {
                    name: name.clone(),
                    workflows: entry.workflows,
                    monitor_all,
                }
            })
            .collect()
    }

    /// The configuration as JSON with credentials masked.
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        let mut copy = self.clone();
        copy.dolphinscheduler.token = mask_secret(&copy.dolphinscheduler.token);
        copy.notification.dingtalk.webhook_url = mask_url(&copy.notification.dingtalk.webhook_url);
        copy.notification.wework.webhook_url = mask_url(&copy.notification.wework.webhook_url);
        copy.notification.dingtalk.secret =
            copy.notification.dingtalk.secret.as_deref().map(mask_secret);
        copy.notification.email.password = mask_secret(&copy.notification.email.password);
        serde_json::to_value(copy).unwrap_or(serde_json::Value::Null)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}

fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else if secret.chars().count() > 8 {
        let head: String = secret.chars().take(4).collect();
        format!("{head}****")
    } else {
        "****".to_string()
    }
}

/// Webhook URLs carry their credential in the query string.
fn mask_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?****"),
        None => url.to_string(),
    }
}
