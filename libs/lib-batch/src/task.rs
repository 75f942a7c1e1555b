//! Task records and the status column encoding.
//!
//! The status column keeps the spreadsheet-era text values so stores can be
//! inspected by hand: empty for pending, `処理中`, `完了`, and `エラー: <msg>`.

use std::fmt;
use std::time::Duration;

use lib_utils::text::truncate_chars;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_PENDING: &str = "";
pub const STATUS_IN_PROGRESS: &str = "処理中";
pub const STATUS_DONE: &str = "完了";
pub const STATUS_FAILED_PREFIX: &str = "エラー";

/// Failure messages are cut to this many characters before they are stored.
pub const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StatusKind {
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed(String),
}

impl TaskStatus {
    pub fn failed(message: impl AsRef<str>) -> Self {
        TaskStatus::Failed(truncate_chars(message.as_ref(), MAX_ERROR_CHARS).to_string())
    }

    pub fn kind(&self) -> StatusKind {
        match self {
            TaskStatus::Pending => StatusKind::Pending,
            TaskStatus::InProgress => StatusKind::InProgress,
            TaskStatus::Done => StatusKind::Done,
            TaskStatus::Failed(_) => StatusKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed(_))
    }

    /// Pending -> InProgress -> Done | Failed. InProgress may be re-entered by
    /// a later run picking up an interrupted task.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use StatusKind::*;
        matches!(
            (self.kind(), next.kind()),
            (Pending, InProgress) | (InProgress, InProgress) | (InProgress, Done) | (InProgress, Failed)
        )
    }

    pub fn to_cell(&self) -> String {
        match self {
            TaskStatus::Pending => STATUS_PENDING.to_string(),
            TaskStatus::InProgress => STATUS_IN_PROGRESS.to_string(),
            TaskStatus::Done => STATUS_DONE.to_string(),
            TaskStatus::Failed(message) => format!("{STATUS_FAILED_PREFIX}: {message}"),
        }
    }

    /// Unrecognized text is read as a failure so it never counts as remaining work.
    pub fn from_cell(cell: &str) -> Self {
        match cell.trim() {
            STATUS_PENDING => TaskStatus::Pending,
            STATUS_IN_PROGRESS => TaskStatus::InProgress,
            STATUS_DONE => TaskStatus::Done,
            other => match other.strip_prefix(STATUS_FAILED_PREFIX) {
                Some(rest) => TaskStatus::Failed(rest.trim_start_matches(':').trim().to_string()),
                None => TaskStatus::Failed(other.to_string()),
            },
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => f.write_str("pending"),
            other => f.write_str(&other.to_cell()),
        }
    }
}

/// Marks which run is working on an in-progress task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub run_id: String,
    pub claimed_at_ms: i64,
}

impl Claim {
    pub fn new(run_id: impl Into<String>, claimed_at_ms: i64) -> Self {
        Self {
            run_id: run_id.into(),
            claimed_at_ms,
        }
    }

    pub fn is_live(&self, now_ms: i64, lease: Duration) -> bool {
        now_ms - self.claimed_at_ms < lease.as_millis() as i64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub key: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub claim: Option<Claim>,
}

impl Task {
    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub key: String,
    pub payload: Value,
}

impl NewTask {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, kind: StatusKind) {
        match kind {
            StatusKind::Pending => self.pending += 1,
            StatusKind::InProgress => self.in_progress += 1,
            StatusKind::Done => self.done += 1,
            StatusKind::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// Tasks that still need a run.
    pub fn remaining(&self) -> usize {
        self.pending + self.in_progress
    }

    pub fn is_complete(&self) -> bool {
        self.total() > 0 && self.remaining() == 0
    }
}

impl<'a> FromIterator<&'a TaskStatus> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = &'a TaskStatus>>(iter: I) -> Self {
        let mut counts = StatusCounts::default();
        for status in iter {
            counts.add(status.kind());
        }
        counts
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} done ({} failed, {} remaining)",
            self.done + self.failed,
            self.total(),
            self.failed,
            self.remaining()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_encoding() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed("quota".to_string()),
        ] {
            assert_eq!(TaskStatus::from_cell(&status.to_cell()), status);
        }
        assert_eq!(TaskStatus::Failed("x".into()).to_cell(), "エラー: x");
        assert_eq!(
            TaskStatus::from_cell("garbage"),
            TaskStatus::Failed("garbage".into())
        );
    }

    #[test]
    fn test_failed_message_is_truncated() {
        let status = TaskStatus::failed("あ".repeat(500));
        match status {
            TaskStatus::Failed(message) => assert_eq!(message.chars().count(), MAX_ERROR_CHARS),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(&TaskStatus::Done));
        assert!(TaskStatus::InProgress.can_transition_to(&TaskStatus::failed("x")));
        assert!(TaskStatus::InProgress.can_transition_to(&TaskStatus::InProgress));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Done));
        assert!(!TaskStatus::Done.can_transition_to(&TaskStatus::InProgress));
        assert!(!TaskStatus::failed("x").can_transition_to(&TaskStatus::Pending));
    }

    #[test]
    fn test_claim_lease() {
        let claim = Claim::new("run-a", 1_000);
        assert!(claim.is_live(1_500, Duration::from_secs(1)));
        assert!(!claim.is_live(2_000, Duration::from_secs(1)));
    }

    #[test]
    fn test_counts() {
        let statuses = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Done,
            TaskStatus::failed("x"),
        ];
        let counts: StatusCounts = statuses.iter().collect();
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.remaining(), 2);
        assert!(!counts.is_complete());
        assert_eq!(counts.to_string(), "3 of 5 done (1 failed, 2 remaining)");
    }
}
