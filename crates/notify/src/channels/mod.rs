//! Notification channel implementations.

pub mod dingtalk;
pub mod email;
pub mod wework;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// Trait for notification channels (DingTalk, WeWork, email).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send a notification event to this channel.
    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}

/// Reply body shared by the DingTalk and WeWork robot webhooks.
#[derive(Debug, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Turn a robot webhook response into a channel result.
async fn check_reply(channel: &'static str, response: reqwest::Response) -> Result<(), ChannelError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(channel, status = %status, body = %body, "Webhook request failed");
        return Err(ChannelError::Other(format!("{channel} returned {status}: {body}")));
    }

    let reply: WebhookReply = response.json().await?;
    if reply.errcode == 0 {
        Ok(())
    } else {
        Err(ChannelError::Rejected {
            code: reply.errcode,
            message: reply.errmsg,
        })
    }
}
