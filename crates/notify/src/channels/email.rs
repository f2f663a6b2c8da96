//! SMTP email notification channel.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::error::ChannelError;
use crate::events::{NotifyEvent, Severity};
use crate::NotifyChannel;

const SENDER_NAME: &str = "Recovery Monitor";
const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// SMTP server and recipients.
#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    /// Implicit TLS (usually port 465); `false` upgrades with STARTTLS
    pub use_ssl: bool,
}

impl Default for EmailSettings {
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

/// Email notification channel.
pub struct EmailChannel {
    settings: EmailSettings,
}

impl EmailChannel {
    #[must_use]
    pub const fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    /// Build the multipart (plain text + HTML) message for `event`.
    fn build_message(&self, event: &NotifyEvent) -> Result<Message, ChannelError> {
        let from: Mailbox = format!("{SENDER_NAME} <{}>", self.settings.from_addr)
            .parse()
            .map_err(|e| ChannelError::Email(format!("from address: {e}")))?;

        let mut builder = Message::builder().from(from).subject(event.title());
        for addr in &self.settings.to_addrs {
            let to: Mailbox = addr
                .parse()
                .map_err(|e| ChannelError::Email(format!("recipient {addr}: {e}")))?;
            builder = builder.to(to);
        }

        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text_body(event)),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body(event)),
                    ),
            )
            .map_err(|e| ChannelError::Email(e.to_string()))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, ChannelError> {
        let host = &self.settings.smtp_host;
        let builder = if self.settings.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
        };

        let mut builder = builder
            .port(self.settings.smtp_port)
            .timeout(Some(SMTP_TIMEOUT));
        if !self.settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl NotifyChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn enabled(&self) -> bool {
        self.settings.enabled
            && !self.settings.smtp_host.is_empty()
            && !self.settings.from_addr.is_empty()
            && !self.settings.to_addrs.is_empty()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        if !self.enabled() {
            return Err(ChannelError::NotConfigured("email".to_string()));
        }

        let message = self.build_message(event)?;

        debug!(
            channel = "email",
            recipients = self.settings.to_addrs.len(),
            title = %event.title(),
            "Sending notification"
        );

        self.transport()?.send(message).await?;
        Ok(())
    }
}

fn text_body(event: &NotifyEvent) -> String {
    let mut lines = vec![
        event.title(),
        String::new(),
        format!("Level: {}", event.severity().as_str()),
        format!("Time: {}", event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")),
    ];
    for (name, value) in event.fields() {
        lines.push(format!("{name}: {value}"));
    }
    lines.push(String::new());
    lines.push(event.description());
    lines.join("\n")
}

fn html_body(event: &NotifyEvent) -> String {
    let severity = event.severity();
    let color = match severity {
        Severity::Info => "#52c41a",
        Severity::Warning => "#faad14",
        Severity::Critical => "#f5222d",
    };

    let mut rows = vec![
        ("Level".to_string(), severity.as_str().to_string()),
        (
            "Time".to_string(),
            event.timestamp().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
    ];
    rows.extend(event.fields());

    let rows: String = rows
        .iter()
        .map(|(name, value)| {
            format!(
                "<tr><td style=\"padding:8px;border:1px solid #ddd;font-weight:bold;background:#f5f5f5\">{}</td>\
                 <td style=\"padding:8px;border:1px solid #ddd\">{}</td></tr>",
                escape(name),
                escape(value)
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"></head>
<body style="font-family:Arial,sans-serif;color:#333;max-width:800px;margin:0 auto;padding:20px">
  <div style="border-left:4px solid {color};padding-left:20px;margin-bottom:20px">
    <h1 style="color:{color};margin:0;font-size:22px">{emoji} {title}</h1>
  </div>
  <table style="width:100%;border-collapse:collapse;margin-bottom:20px">{rows}</table>
  <p style="white-space:pre-wrap">{description}</p>
  <p style="margin-top:30px;color:#999;font-size:12px">Sent automatically by the workflow recovery monitor.</p>
</body>
</html>"#,
        emoji = severity.emoji(),
        title = escape(&event.title()),
        description = escape(&event.description()),
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
