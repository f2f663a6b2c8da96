//! Error types for the notification system.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when sending notifications.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// The webhook answered with a non-zero `errcode`
    #[error("Webhook rejected message (errcode {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Addresses or message body could not be turned into an email
    #[error("Invalid email: {0}")]
    Email(String),

    /// The SMTP server refused the message or could not be reached
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Rate limiter state file could not be read
    #[error("Failed to read rate limit state {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}
