//! Per-workflow notification rate limiting.
//!
//! A flapping workflow produces the same notification on every poll cycle.
//! The limiter keeps a sliding window of send times per key and refuses
//! anything beyond `max_notifications` inside that window.
//!
//! A limiter opened with [`RateLimiter::open`] rewrites its state file after
//! every admitted send (temp file, then rename), so one-shot runs started
//! from cron share one budget.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::ChannelError;

type SendLog = BTreeMap<String, Vec<DateTime<Utc>>>;

/// Sliding-window rate limiter keyed by an arbitrary string.
#[derive(Debug)]
pub struct RateLimiter {
    max_notifications: usize,
    window: Duration,
    path: Option<PathBuf>,
    sent: Mutex<SendLog>,
}

impl RateLimiter {
    /// In-memory limiter allowing `max_notifications` per key within `window_hours`.
    #[must_use]
    pub fn new(max_notifications: usize, window_hours: u32) -> Self {
        Self {
            max_notifications,
            window: Duration::hours(i64::from(window_hours)),
            path: None,
            sent: Mutex::new(SendLog::new()),
        }
    }

    /// Limiter backed by the JSON file at `path`.
    ///
    /// A missing file starts empty. A file that does not parse is logged and
    /// replaced on the next send: losing rate limit history only means a few
    /// extra messages.
    pub fn open(
        path: impl Into<PathBuf>,
        max_notifications: usize,
        window_hours: u32,
    ) -> Result<Self, ChannelError> {
        let path = path.into();

        let sent = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => SendLog::new(),
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Unreadable rate limit state, starting empty");
                SendLog::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SendLog::new(),
            Err(source) => return Err(ChannelError::State { path, source }),
        };

        debug!(path = %path.display(), keys = sent.len(), "Loaded rate limit state");

        Ok(Self {
            path: Some(path),
            sent: Mutex::new(sent),
            ..Self::new(max_notifications, window_hours)
        })
    }

    /// Record a send for `key` at `now` if the budget allows it.
    ///
    /// Returns `false` when the key already used its budget for the window.
    pub fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut sent = self
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let cutoff = now - self.window;
        sent.retain(|_, times| {
            times.retain(|t| *t > cutoff);
            !times.is_empty()
        });

        let times = sent.entry(key.to_string()).or_default();
        if times.len() >= self.max_notifications {
            return false;
        }
        times.push(now);

        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &sent) {
                warn!(path = %path.display(), error = %e, "Failed to save rate limit state");
            }
        }
        true
    }

    /// Number of sends recorded for `key` inside the window ending at `now`.
    #[must_use]
    pub fn count(&self, key: &str, now: DateTime<Utc>) -> usize {
        let sent = self
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let cutoff = now - self.window;
        sent.get(key)
            .map_or(0, |times| times.iter().filter(|t| **t > cutoff).count())
    }
}

fn persist(path: &Path, sent: &SendLog) -> std::io::Result<()> {
    let content = serde_json::to_string_pretty(sent)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_budget_per_key() {
        let limiter = RateLimiter::new(2, 24);
        let now = Utc::now();

        assert!(limiter.try_acquire("etl/1", now));
        assert!(limiter.try_acquire("etl/1", now));
        assert!(!limiter.try_acquire("etl/1", now));

        // other workflows are unaffected
        assert!(limiter.try_acquire("etl/2", now));
        assert_eq!(limiter.count("etl/1", now), 2);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(1, 1);
        let start = Utc::now();

        assert!(limiter.try_acquire("k", start));
        assert!(!limiter.try_acquire("k", start + Duration::minutes(30)));
        assert!(limiter.try_acquire("k", start + Duration::minutes(61)));
    }

    #[test]
    fn test_budget_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("rate_limit.json");
        let now = Utc::now();

        let limiter = RateLimiter::open(&path, 1, 24).unwrap();
        assert!(limiter.try_acquire("etl/1", now));
        drop(limiter);

        let reopened = RateLimiter::open(&path, 1, 24).unwrap();
        assert_eq!(reopened.count("etl/1", now), 1);
        assert!(!reopened.try_acquire("etl/1", now + Duration::minutes(5)));
        assert!(reopened.try_acquire("etl/2", now));
    }

    #[test]
    fn test_corrupt_state_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rate_limit.json");
        std::fs::write(&path, "{not json").unwrap();

        let limiter = RateLimiter::open(&path, 1, 24).unwrap();
        assert_eq!(limiter.count("etl/1", Utc::now()), 0);
        assert!(limiter.try_acquire("etl/1", Utc::now()));

        let saved: SendLog =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["etl/1"].len(), 1);
    }
}
