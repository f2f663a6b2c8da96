//! Durable recovery bookkeeping.
//!
//! The whole map is loaded at open and rewritten on every mutation: write to
//! a sibling temp file, then rename over the real one. A reader never sees a
//! half-written file and a crash leaves either the old or the new state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{InstanceId, ProjectCode, TimeWindow};

/// Which branch the policy engine last took for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Recover,
    NotifyOnly,
    Skip,
}

/// Everything remembered about one workflow instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryRecord {
    pub workflow_name: String,
    pub project_code: ProjectCode,
    pub attempt_count: u32,
    pub attempt_timestamps: Vec<DateTime<Utc>>,
    pub last_decision: Option<DecisionKind>,
    pub window_failure_count: u32,
    /// One entry per observed failure episode.
    pub failure_timestamps: Vec<DateTime<Utc>>,
    pub successful_resumes: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecoveryRecord {
    #[must_use]
    pub fn new(workflow_name: impl Into<String>, project_code: ProjectCode) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            project_code,
            ..Self::default()
        }
    }

    /// Failure episodes that fall inside `window`.
    #[must_use]
    pub fn failures_within(&self, window: &TimeWindow) -> u32 {
        self.failure_timestamps
            .iter()
            .filter(|t| window.contains(**t))
            .count() as u32
    }

    #[must_use]
    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.attempt_timestamps.last().copied()
    }
}

/// Aggregate view over all records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub tracked_instances: usize,
    pub total_attempts: u64,
    pub successful_resumes: u64,
    pub instances_notify_only: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// JSON-file backed map from instance id to [`RecoveryRecord`].
#[derive(Debug)]
pub struct RecoveryStore {
    path: PathBuf,
    records: Mutex<BTreeMap<InstanceId, RecoveryRecord>>,
}

impl RecoveryStore {
    /// Load the store from `path`. A missing file is an empty store; a file
    /// that does not parse is an error so history is never silently lost.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file yet, starting empty");
                BTreeMap::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        info!(
            path = %path.display(),
            records = records.len(),
            "Loaded recovery state"
        );

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, id: InstanceId) -> Option<RecoveryRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    /// Insert or replace the record for `id` and flush to disk.
    ///
    /// The in-memory map only changes once the write succeeded, so memory and
    /// disk never disagree.
    pub async fn upsert(&self, id: InstanceId, record: RecoveryRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        next.insert(id, record);
        self.write(&next).await?;
        *records = next;
        Ok(())
    }

    /// Remove one record, or every record when `id` is `None`.
    /// Returns how many records were removed.
    pub async fn clear(&self, id: Option<InstanceId>) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let removed = match id {
            Some(id) => usize::from(next.remove(&id).is_some()),
            None => {
                let count = next.len();
                next.clear();
                count
            }
        };
        if removed > 0 {
            self.write(&next).await?;
            *records = next;
        }
        info!(removed, instance_id = ?id, "Cleared recovery records");
        Ok(removed)
    }

    /// Rewrite the file from the in-memory map.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let records = self.records.lock().await;
        self.write(&records).await
    }

    /// Snapshot of every record.
    pub async fn records(&self) -> BTreeMap<InstanceId, RecoveryRecord> {
        self.records.lock().await.clone()
    }

    pub async fn statistics(&self) -> StoreStatistics {
        let records = self.records.lock().await;
        let mut stats = StoreStatistics {
            tracked_instances: records.len(),
            ..StoreStatistics::default()
        };
        for record in records.values() {
            stats.total_attempts += u64::from(record.attempt_count);
            stats.successful_resumes += u64::from(record.successful_resumes);
            if record.last_decision == Some(DecisionKind::NotifyOnly) {
                stats.instances_notify_only += 1;
            }
            stats.last_updated = stats.last_updated.max(record.updated_at);
        }
        stats
    }

    async fn write(&self, records: &BTreeMap<InstanceId, RecoveryRecord>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        debug!(path = %self.path.display(), records = records.len(), "Flushed recovery state");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(attempts: u32) -> RecoveryRecord {
        RecoveryRecord {
            attempt_count: attempts,
            last_decision: Some(DecisionKind::Recover),
            ..RecoveryRecord::new("daily", 7)
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = RecoveryStore::open(dir.path().join("state.json")).await.unwrap();
        assert!(store.records().await.is_empty());
        assert_eq!(store.get(1).await, None);
    }

    #[tokio::test]
    async fn test_upsert_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = RecoveryStore::open(&path).await.unwrap();
        store.upsert(42, record(2)).await.unwrap();
        drop(store);

        let reopened = RecoveryStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(42).await, Some(record(2)));
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_file_is_keyed_by_instance_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = RecoveryStore::open(&path).await.unwrap();
        store.upsert(42, record(1)).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["42"]["attempt_count"], 1);
        assert_eq!(json["42"]["last_decision"], "recover");
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = RecoveryStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_clear_one_and_all() {
        let dir = TempDir::new().unwrap();
        let store = RecoveryStore::open(dir.path().join("state.json")).await.unwrap();
        store.upsert(1, record(1)).await.unwrap();
        store.upsert(2, record(1)).await.unwrap();
        store.upsert(3, record(1)).await.unwrap();

        assert_eq!(store.clear(Some(2)).await.unwrap(), 1);
        assert_eq!(store.clear(Some(2)).await.unwrap(), 0);
        assert_eq!(store.get(2).await, None);
        assert_eq!(store.clear(None).await.unwrap(), 2);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        // the state path is a directory, so the rename fails
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();

        let store = RecoveryStore {
            path,
            records: Mutex::new(BTreeMap::new()),
        };
        assert!(store.upsert(1, record(1)).await.is_err());
        assert_eq!(store.get(1).await, None);
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = TempDir::new().unwrap();
        let store = RecoveryStore::open(dir.path().join("state.json")).await.unwrap();

        let mut notify_only = record(3);
        notify_only.last_decision = Some(DecisionKind::NotifyOnly);
        let mut resumed = record(2);
        resumed.successful_resumes = 2;

        store.upsert(1, notify_only).await.unwrap();
        store.upsert(2, resumed).await.unwrap();

        let stats = store.statistics().await;
        assert_eq!(stats.tracked_instances, 2);
        assert_eq!(stats.total_attempts, 5);
        assert_eq!(stats.successful_resumes, 2);
        assert_eq!(stats.instances_notify_only, 1);
    }
}
