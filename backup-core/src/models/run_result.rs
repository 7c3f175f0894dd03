use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 一次运行的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = crate::BackupError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "failed" => Ok(RunOutcome::Failed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            "timed_out" => Ok(RunOutcome::TimedOut),
            other => Err(crate::BackupError::persistence(format!(
                "未知的运行结果: {other}"
            ))),
        }
    }
}

/// 引擎 summary 消息中的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSummary {
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unmodified: u64,
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
}

/// 运行记录，运行结束时追加写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub summary: BackupSummary,
    pub error: Option<String>,
}

impl RunResult {
    pub fn snapshot_id(&self) -> Option<&str> {
        self.summary.snapshot_id.as_deref()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
