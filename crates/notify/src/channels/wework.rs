//! WeWork (WeCom) group robot notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// WeWork group robot notification channel.
pub struct WeWorkChannel {
    webhook_url: Option<String>,
    mentioned_list: Vec<String>,
    mentioned_mobile_list: Vec<String>,
    client: reqwest::Client,
}

impl WeWorkChannel {
    /// Create a WeWork channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        let webhook_url = (!webhook_url.is_empty()).then_some(webhook_url);
        Self {
            webhook_url,
            mentioned_list: Vec::new(),
            mentioned_mobile_list: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Mention members by user id (`"@all"` for everybody) and by phone number.
    #[must_use]
    pub fn with_mentions(mut self, user_ids: Vec<String>, mobiles: Vec<String>) -> Self {
        self.mentioned_list = user_ids;
        self.mentioned_mobile_list = mobiles;
        self
    }

    /// Format an event as WeWork markdown. WeWork only understands a small
    /// subset (headers, quotes, `<font color>`).
    fn format_content(&self, event: &NotifyEvent) -> String {
        let severity = event.severity();
        let mut lines = vec![
            format!("## {} {}", severity.emoji(), event.title()),
            String::new(),
            format!("> Level: <font color=\"comment\">{}</font>", severity.as_str()),
            format!(
                "> Time: <font color=\"comment\">{}</font>",
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            ),
        ];
        for (name, value) in event.fields() {
            lines.push(format!("> {name}: <font color=\"comment\">{value}</font>"));
        }
        lines.push(String::new());
        lines.push(event.description());
        // markdown messages only notify users through inline `<@userid>` tags
        if !self.mentioned_list.is_empty() {
            lines.push(String::new());
            lines.push(
                self.mentioned_list
                    .iter()
                    .map(|id| format!("<@{}>", id.trim_start_matches('@')))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
        lines.join("\n")
    }
}

#[async_trait]
impl NotifyChannel for WeWorkChannel {
    fn name(&self) -> &'static str {
        "wework"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured("wework.webhook_url".to_string()))?;

        let payload = WeWorkPayload {
            msgtype: "markdown",
            markdown: WeWorkMarkdown {
                content: self.format_content(event),
                mentioned_list: self.mentioned_list.clone(),
                mentioned_mobile_list: self.mentioned_mobile_list.clone(),
            },
        };

        debug!(channel = "wework", title = %event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        super::check_reply("wework", response).await
    }
}

#[derive(Debug, Serialize)]
struct WeWorkPayload {
    msgtype: &'static str,
    markdown: WeWorkMarkdown,
}

#[derive(Debug, Serialize)]
struct WeWorkMarkdown {
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mentioned_list: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mentioned_mobile_list: Vec<String>,
}
