//! Operator notifications for workflow recovery events.
//!
//! This crate provides a fire-and-forget notification system for telling
//! operators when a failed workflow was resumed, when a resume failed, and
//! when an instance needs a human because automatic recovery was refused.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent, WeWorkChannel, WorkflowRef};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let notifier = Notifier::with_channels(vec![Arc::new(WeWorkChannel::new(
//!     "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=...".to_string(),
//! ))]);
//!
//! notifier.notify(NotifyEvent::RecoveryTriggered {
//!     workflow: WorkflowRef {
//!         project: "etl".to_string(),
//!         workflow_name: "daily-load".to_string(),
//!         definition_code: 7,
//!         instance_id: 42,
//!         started_at: None,
//!     },
//!     attempt: 1,
//!     max_attempts: 3,
//!     timestamp: chrono::Utc::now(),
//! });
//!
//! // wait for in-flight sends before the runtime goes away
//! notifier.shutdown().await;
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`DingTalkChannel`] and [`WeWorkChannel`] implement robot webhooks
//! - [`EmailChannel`] sends HTML mail over SMTP
//! - [`RateLimiter`] caps notifications per workflow definition within a time window
//! - [`Notifier`] dispatches events to all enabled channels and tracks the
//!   sends so [`Notifier::shutdown`] can wait for them

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;
pub mod rate_limit;

pub use channels::dingtalk::{DingTalkChannel, DingTalkSettings};
pub use channels::email::{EmailChannel, EmailSettings};
pub use channels::wework::WeWorkChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity, WorkflowRef};
pub use rate_limit::RateLimiter;

use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Central notification dispatcher.
///
/// The `Notifier` manages multiple notification channels and dispatches
/// events to all enabled channels in a fire-and-forget manner.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    limiter: Option<RateLimiter>,
    disabled: bool,
    in_flight: TaskTracker,
}

impl Notifier {
    /// Create a notifier with specific channels. Channels that report
    /// themselves as disabled are dropped.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        let channels: Vec<_> = channels.into_iter().filter(|c| c.enabled()).collect();

        if channels.is_empty() {
            info!("No notification channels configured");
        } else {
            info!(
                channel_count = channels.len(),
                "Notification system initialized"
            );
        }

        Self {
            channels,
            limiter: None,
            disabled: false,
            in_flight: TaskTracker::new(),
        }
    }

    /// Attach a rate limiter applied per [`NotifyEvent::rate_key`].
    #[must_use]
    pub fn with_rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: vec![],
            limiter: None,
            disabled: true,
            in_flight: TaskTracker::new(),
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Whether the rate limiter lets this event through (and records it).
    fn admit(&self, event: &NotifyEvent) -> bool {
        match &self.limiter {
            Some(limiter) => {
                let key = event.rate_key();
                let admitted = limiter.try_acquire(&key, event.timestamp());
                if !admitted {
                    debug!(key = %key, "Notification rate limit reached, dropping event");
                }
                admitted
            }
            None => true,
        }
    }

    /// Send a notification to all enabled channels (fire-and-forget).
    ///
    /// This method spawns a tracked task for each channel and returns
    /// immediately. Errors are logged but not propagated to the caller.
    /// Call [`Notifier::shutdown`] before the runtime exits.
    pub fn notify(&self, event: NotifyEvent) {
        if !self.has_channels() {
            debug!("No channels configured, skipping event");
            return;
        }

        if !self.admit(&event) {
            return;
        }

        let event = Arc::new(event);

        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);

            self.in_flight.spawn(async move {
                let channel_name = channel.name();

                match channel.send(&event).await {
                    Ok(()) => {
                        debug!(channel = channel_name, "Notification sent");
                    }
                    Err(e) => {
                        error!(
                            channel = channel_name,
                            error = %e,
                            "Failed to send notification"
                        );
                    }
                }
            });
        }
    }

    /// Wait for every send started by [`Notifier::notify`] to finish.
    ///
    /// Events notified afterwards are still delivered and tracked, so a
    /// later call waits for those too.
    pub async fn shutdown(&self) {
        self.in_flight.close();
        if !self.in_flight.is_empty() {
            debug!(pending = self.in_flight.len(), "Waiting for notifications in flight");
        }
        self.in_flight.wait().await;
        self.in_flight.reopen();
    }

    /// Send a notification and wait for all channels to complete.
    ///
    /// Unlike `notify()`, this method waits for all notifications to be sent
    /// and collects any errors. Useful for testing or when delivery confirmation
    /// is needed.
    pub async fn notify_and_wait(
        &self,
        event: NotifyEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        if !self.has_channels() || !self.admit(&event) {
            return vec![];
        }

        let mut results = vec![];

        for channel in &self.channels {
            let channel_name = channel.name().to_string();
            let result = channel.send(&event).await;
            results.push((channel_name, result));
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        sent: AtomicUsize,
        latency: std::time::Duration,
    }

    impl CountingChannel {
        fn new(latency_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
                latency: std::time::Duration::from_millis(latency_ms),
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for CountingChannel {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _event: &NotifyEvent) -> Result<(), ChannelError> {
            tokio::time::sleep(self.latency).await;
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn triggered(instance_id: u64) -> NotifyEvent {
        NotifyEvent::RecoveryTriggered {
            workflow: WorkflowRef {
                project: "etl".to_string(),
                workflow_name: format!("daily-{instance_id}-20250101"),
                definition_code: 9,
                instance_id,
                started_at: None,
            },
            attempt: 1,
            max_attempts: 3,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(!notifier.has_channels());
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn test_disabled_channels_are_dropped() {
        let notifier = Notifier::with_channels(vec![Arc::new(WeWorkChannel::new(String::new()))]);
        assert!(!notifier.has_channels());
    }

    #[test]
    fn test_event_titles_and_severity() {
        let event = triggered(1);
        assert_eq!(event.title(), "Recovery triggered: daily-1-20250101");
        assert_eq!(event.severity(), Severity::Info);
        assert_eq!(event.rate_key(), "etl/9");
    }

    #[tokio::test]
    async fn test_rate_limit_applies_across_runs_of_a_definition() {
        let channel = CountingChannel::new(0);
        let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>])
            .with_rate_limit(RateLimiter::new(2, 24));

        for id in 0..5 {
            notifier.notify_and_wait(triggered(id)).await;
        }

        assert_eq!(channel.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_sends_in_flight() {
        let channel = CountingChannel::new(100);
        let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>]);

        notifier.notify(triggered(1));
        notifier.notify(triggered(2));
        assert_eq!(channel.sent.load(Ordering::SeqCst), 0);

        notifier.shutdown().await;
        assert_eq!(channel.sent.load(Ordering::SeqCst), 2);

        // still usable after a drain
        notifier.notify(triggered(3));
        notifier.shutdown().await;
        assert_eq!(channel.sent.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_pending_sends_survive_runtime_shutdown_when_drained() {
        let channel = CountingChannel::new(50);
        let notifier = Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>]);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            notifier.notify(triggered(1));
            notifier.shutdown().await;
        });
        drop(runtime);

        assert_eq!(channel.sent.load(Ordering::SeqCst), 1);
    }
}
