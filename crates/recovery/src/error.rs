//! Error taxonomy for the recovery monitor.
//!
//! Decision-level errors (`UnknownStatusError`, `ValidationError`, most
//! `GatewayError`s) are contained to a single instance by the poll loop.
//! `GatewayError::Unauthorized` and every `StoreError` are fatal.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::InstanceId;

/// The scheduler reported a status outside the recognized vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scheduler status `{0}`")]
pub struct UnknownStatusError(pub String);

/// Failure of a call to the scheduler API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Token rejected; the process cannot make progress until it is fixed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The requested project, definition or instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call did not complete within the client timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection refused, DNS failure, 5xx from a proxy, etc.
    #[error("scheduler unreachable: {0}")]
    Unreachable(String),

    /// The API answered with a non-zero result code.
    #[error("scheduler API error {code}: {message}")]
    Api { code: i64, message: String },

    /// The response body did not match the expected shape.
    #[error("failed to decode scheduler response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Errors that must stop the whole process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Errors worth retrying on the next poll cycle.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unreachable(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => Self::Unauthorized(err.to_string()),
                404 => Self::NotFound(err.to_string()),
                _ => Self::Unreachable(err.to_string()),
            }
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// Why a workflow instance could not be validated.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("instance {instance_id}: task `{task}` has {source}")]
    UnknownStatus {
        instance_id: InstanceId,
        task: String,
        #[source]
        source: UnknownStatusError,
    },

    #[error("instance {instance_id}: sub-workflow nesting exceeds depth limit {limit}")]
    DepthExceeded {
        instance_id: InstanceId,
        limit: usize,
    },

    #[error("instance {instance_id}: {source}")]
    Gateway {
        instance_id: InstanceId,
        #[source]
        source: GatewayError,
    },
}

/// Failure reading or writing the recovery state file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access state file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize recovery state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("environment variable {var} has invalid value `{value}`")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that terminate the poll loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("none of the configured projects exist on the scheduler")]
    NoActiveProjects,
}
