//! DingTalk robot webhook notification channel.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

type HmacSha256 = Hmac<Sha256>;

/// Settings for a DingTalk robot.
#[derive(Debug, Clone, Default)]
pub struct DingTalkSettings {
    /// Robot webhook URL (including `access_token`)
    pub webhook_url: String,
    /// Security keyword configured on the robot; every message must contain it
    pub keyword: Option<String>,
    /// Signing secret (`SEC...`) when the robot uses signature security
    pub secret: Option<String>,
    /// Phone numbers to @-mention
    pub at_mobiles: Vec<String>,
    /// Mention everybody in the group
    pub at_all: bool,
}

/// DingTalk robot notification channel.
pub struct DingTalkChannel {
    settings: DingTalkSettings,
    client: reqwest::Client,
}

impl DingTalkChannel {
    /// Create a DingTalk channel with the given robot settings.
    #[must_use]
    pub fn new(settings: DingTalkSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a DingTalk markdown payload.
    fn format_payload(&self, event: &NotifyEvent) -> DingTalkPayload {
        let severity = event.severity();
        let mut lines = vec![
            format!("## {} {}", severity.emoji(), event.title()),
            String::new(),
            format!("**Level**: {}", severity.as_str()),
            format!(
                "**Time**: {}",
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            ),
            String::new(),
            "---".to_string(),
            String::new(),
            event.description(),
            String::new(),
        ];
        for (name, value) in event.fields() {
            lines.push(format!("- **{name}**: {value}"));
        }
        if let Some(keyword) = self.settings.keyword.as_deref().filter(|k| !k.is_empty()) {
            lines.push(String::new());
            lines.push(format!("[{keyword}]"));
        }

        let at = (self.settings.at_all || !self.settings.at_mobiles.is_empty()).then(|| At {
            at_mobiles: self.settings.at_mobiles.clone(),
            is_at_all: self.settings.at_all,
        });

        DingTalkPayload {
            msgtype: "markdown",
            markdown: Markdown {
                title: event.title(),
                text: lines.join("\n"),
            },
            at,
        }
    }
}

#[async_trait]
impl NotifyChannel for DingTalkChannel {
    fn name(&self) -> &'static str {
        "dingtalk"
    }

    fn enabled(&self) -> bool {
        !self.settings.webhook_url.is_empty()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        if !self.enabled() {
            return Err(ChannelError::NotConfigured("dingtalk.webhook_url".to_string()));
        }

        let payload = self.format_payload(event);

        debug!(channel = "dingtalk", title = %event.title(), "Sending notification");

        let mut request = self.client.post(&self.settings.webhook_url).json(&payload);
        if let Some(secret) = self.settings.secret.as_deref().filter(|s| !s.is_empty()) {
            let timestamp = Utc::now().timestamp_millis();
            let sign = signature(secret, timestamp)?;
            request = request.query(&[("timestamp", timestamp.to_string()), ("sign", sign)]);
        }

        let response = request.send().await?;

        super::check_reply("dingtalk", response).await
    }
}

/// `base64(HmacSHA256(secret, "{timestamp}\n{secret}"))`, as the robot
/// expects in the `sign` query parameter.
fn signature(secret: &str, timestamp_ms: i64) -> Result<String, ChannelError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ChannelError::Other(format!("invalid DingTalk secret: {e}")))?;
    mac.update(format!("{timestamp_ms}\n{secret}").as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

// =============================================================================
// DingTalk API types
// =============================================================================

#[derive(Debug, Serialize)]
struct DingTalkPayload {
    msgtype: &'static str,
    markdown: Markdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    at: Option<At>,
}

#[derive(Debug, Serialize)]
struct Markdown {
    title: String,
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct At {
    at_mobiles: Vec<String>,
    is_at_all: bool,
}
