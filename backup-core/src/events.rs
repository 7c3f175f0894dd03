use crate::models::RunOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// 进度更新
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// 0.0 ~ 1.0
    pub percent_done: f64,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub files_done: u64,
    pub total_files: u64,
    pub current_files: Vec<String>,
}

/// 核心服务广播的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    TaskCreated { task_id: i64 },
    TaskUpdated { task_id: i64 },
    TaskDeleted { task_id: i64 },
    RepositoryCreated { repository_id: i64 },
    RepositoryUpdated { repository_id: i64 },
    RepositoryDeleted { repository_id: i64 },

    BackupStarted { task_id: i64 },
    BackupProgress { task_id: i64, progress: ProgressUpdate },
    BackupFinished {
        task_id: i64,
        success: bool,
        outcome: RunOutcome,
        snapshot_id: Option<String>,
        message: Option<String>,
    },

    CredentialRequired { repository_id: i64 },
    CredentialRejected { repository_id: i64, message: String },
    CredentialExpired { repository_id: i64 },

    TaskScheduled { task_id: i64, next_run: Option<DateTime<Utc>> },
    TaskTriggered { task_id: i64 },
    TaskTriggerFailed { task_id: i64, message: String },
    /// 运行记录或任务状态没有保存成功，界面需要提示数据可能不一致
    PersistenceFailed { task_id: i64, message: String },

    SnapshotsUpdated { repository_id: i64 },
    SnapshotDeleted { repository_id: i64, snapshot_id: String },

    RestoreStarted { repository_id: i64, snapshot_id: String },
    RestoreProgress { repository_id: i64, progress: ProgressUpdate },
    RestoreFinished {
        repository_id: i64,
        snapshot_id: String,
        success: bool,
        message: Option<String>,
    },

    MaintenanceFinished {
        repository_id: i64,
        operation: String,
        success: bool,
        message: Option<String>,
    },
}

/// 基于 broadcast 的事件总线
///
/// 订阅者落后太多时会收到 `RecvError::Lagged`，需要自行刷新状态。
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 没有订阅者时直接丢弃
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}
