//! Task status classification.
//!
//! The scheduler reports statuses either by name (`FAILURE`) or by the
//! ordinal of its execution status enum (`6`). Both map onto three
//! categories that the validator reasons about.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::UnknownStatusError;
use crate::types::TaskRecord;

/// Coarse category of a task or instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCategory {
    /// Terminal success.
    Done,
    /// Terminal failure, including forcibly killed tasks.
    Failed,
    /// Anything that has not reached a terminal state. Paused, stopped and
    /// blocked tasks belong here: an operator is holding them.
    InProgress,
}

/// The scheduler's execution status vocabulary, in ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    SubmittedSuccess,
    RunningExecution,
    ReadyPause,
    Pause,
    ReadyStop,
    Stop,
    Failure,
    Success,
    NeedFaultTolerance,
    Kill,
    WaitingThread,
    WaitingDepend,
    DelayExecution,
    ForcedSuccess,
    SerialWait,
    Dispatch,
    ReadyBlock,
    Block,
}

const VOCABULARY: [(TaskStatus, &str); 18] = [
    (TaskStatus::SubmittedSuccess, "SUBMITTED_SUCCESS"),
    (TaskStatus::RunningExecution, "RUNNING_EXECUTION"),
    (TaskStatus::ReadyPause, "READY_PAUSE"),
    (TaskStatus::Pause, "PAUSE"),
    (TaskStatus::ReadyStop, "READY_STOP"),
    (TaskStatus::Stop, "STOP"),
    (TaskStatus::Failure, "FAILURE"),
    (TaskStatus::Success, "SUCCESS"),
    (TaskStatus::NeedFaultTolerance, "NEED_FAULT_TOLERANCE"),
    (TaskStatus::Kill, "KILL"),
    (TaskStatus::WaitingThread, "WAITING_THREAD"),
    (TaskStatus::WaitingDepend, "WAITING_DEPEND"),
    (TaskStatus::DelayExecution, "DELAY_EXECUTION"),
    (TaskStatus::ForcedSuccess, "FORCED_SUCCESS"),
    (TaskStatus::SerialWait, "SERIAL_WAIT"),
    (TaskStatus::Dispatch, "DISPATCH"),
    (TaskStatus::ReadyBlock, "READY_BLOCK"),
    (TaskStatus::Block, "BLOCK"),
];

impl TaskStatus {
    /// Numeric code used by the scheduler.
    #[must_use]
    pub fn code(self) -> u8 {
        VOCABULARY
            .iter()
            .position(|(status, _)| *status == self)
            .map_or(u8::MAX, |idx| idx as u8)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        VOCABULARY
            .iter()
            .find(|(status, _)| *status == self)
            .map_or("UNKNOWN", |(_, name)| name)
    }

    #[must_use]
    pub const fn category(self) -> TaskCategory {
        match self {
            Self::Success | Self::ForcedSuccess => TaskCategory::Done,
            Self::Failure | Self::Kill | Self::NeedFaultTolerance => TaskCategory::Failed,
            Self::SubmittedSuccess
            | Self::RunningExecution
            | Self::ReadyPause
            | Self::Pause
            | Self::ReadyStop
            | Self::Stop
            | Self::WaitingThread
            | Self::WaitingDepend
            | Self::DelayExecution
            | Self::SerialWait
            | Self::Dispatch
            | Self::ReadyBlock
            | Self::Block => TaskCategory::InProgress,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();

        if let Ok(code) = trimmed.parse::<usize>() {
            return VOCABULARY
                .get(code)
                .map(|(status, _)| *status)
                .ok_or_else(|| UnknownStatusError(raw.to_string()));
        }

        VOCABULARY
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(trimmed))
            .map(|(status, _)| *status)
            .ok_or_else(|| UnknownStatusError(raw.to_string()))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classify a raw status string.
pub fn classify(raw_status: &str) -> Result<TaskCategory, UnknownStatusError> {
    raw_status.parse::<TaskStatus>().map(TaskStatus::category)
}

/// Retry bookkeeping of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub used: u32,
    pub limit: u32,
}

impl RetryBudget {
    /// The scheduler will not retry this task again on its own.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

#[must_use]
pub const fn retry_budget(task: &TaskRecord) -> RetryBudget {
    RetryBudget {
        used: task.retry_count,
        limit: task.max_retries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert_eq!(classify("SUCCESS").unwrap(), TaskCategory::Done);
        assert_eq!(classify("FORCED_SUCCESS").unwrap(), TaskCategory::Done);
        assert_eq!(classify("FAILURE").unwrap(), TaskCategory::Failed);
        assert_eq!(classify("KILL").unwrap(), TaskCategory::Failed);
        assert_eq!(classify("NEED_FAULT_TOLERANCE").unwrap(), TaskCategory::Failed);
    }

    #[test]
    fn test_operator_held_states_are_in_progress() {
        for raw in ["PAUSE", "READY_PAUSE", "STOP", "READY_STOP", "BLOCK", "READY_BLOCK"] {
            assert_eq!(classify(raw).unwrap(), TaskCategory::InProgress, "{raw}");
        }
    }

    #[test]
    fn test_numeric_codes_and_case() {
        assert_eq!(classify("6").unwrap(), TaskCategory::Failed);
        assert_eq!(classify("7").unwrap(), TaskCategory::Done);
        assert_eq!(classify("1").unwrap(), TaskCategory::InProgress);
        assert_eq!(classify(" running_execution ").unwrap(), TaskCategory::InProgress);
        assert_eq!(TaskStatus::Kill.code(), 9);
        assert_eq!("17".parse::<TaskStatus>().unwrap(), TaskStatus::Block);
    }

    #[test]
    fn test_unknown_status() {
        assert_eq!(classify("EXPLODED"), Err(UnknownStatusError("EXPLODED".into())));
        assert!(classify("18").is_err());
        assert!(classify("").is_err());
    }

    #[test]
    fn test_every_code_round_trips_through_name() {
        for (code, (status, name)) in VOCABULARY.iter().enumerate() {
            assert_eq!(status.code() as usize, code);
            assert_eq!(name.parse::<TaskStatus>().unwrap(), *status);
        }
    }

    #[test]
    fn test_retry_budget() {
        let task = TaskRecord::new(1, "load", "FAILURE").with_retries(2, 2);
        assert!(retry_budget(&task).exhausted());

        let task = TaskRecord::new(1, "load", "FAILURE").with_retries(1, 2);
        assert!(!retry_budget(&task).exhausted());

        // no retries configured: first failure is final
        let task = TaskRecord::new(1, "load", "FAILURE");
        assert!(retry_budget(&task).exhausted());
    }
}
