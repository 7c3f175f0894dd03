use crate::error::{BackupError, Result};
use crate::models::BackupTask;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 运行互斥的粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotScope {
    /// 整个进程同时只运行一个备份
    Global,
    /// 同一仓库同时只运行一个备份
    #[default]
    Repository,
    /// 同一任务同时只运行一个备份
    Task,
}

impl SlotScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotScope::Global => "global",
            SlotScope::Repository => "repository",
            SlotScope::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SlotKey {
    Global,
    Repository(i64),
    Task(i64),
}

struct ActiveRun {
    task_id: i64,
    cancel: CancellationToken,
}

/// 运行槽位表
pub struct RunSlots {
    scope: SlotScope,
    active: DashMap<SlotKey, ActiveRun>,
}

impl RunSlots {
    pub fn new(scope: SlotScope) -> Arc<Self> {
        Arc::new(Self {
            scope,
            active: DashMap::new(),
        })
    }

    pub fn scope(&self) -> SlotScope {
        self.scope
    }

    fn key_for(&self, task: &BackupTask) -> SlotKey {
        match self.scope {
            SlotScope::Global => SlotKey::Global,
            SlotScope::Repository => SlotKey::Repository(task.repository_id),
            SlotScope::Task => SlotKey::Task(task.id),
        }
    }

    /// 占用槽位，已被占用时返回 AlreadyRunning
    pub fn try_acquire(
        self: &Arc<Self>,
        task: &BackupTask,
        cancel: CancellationToken,
    ) -> Result<SlotGuard> {
        // 任务级互斥在任何粒度下都成立
        if self.is_task_running(task.id) {
            return Err(BackupError::already_running(format!(
                "任务 {} 正在运行",
                task.id
            )));
        }

        let key = self.key_for(task);
        match self.active.entry(key) {
            Entry::Occupied(occupied) => Err(BackupError::already_running(format!(
                "任务 {} 正在运行，无法启动任务 {}",
                occupied.get().task_id,
                task.id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(ActiveRun {
                    task_id: task.id,
                    cancel,
                });
                Ok(SlotGuard {
                    slots: Arc::clone(self),
                    key,
                })
            }
        }
    }

    pub fn is_task_running(&self, task_id: i64) -> bool {
        self.active.iter().any(|run| run.task_id == task_id)
    }

    pub fn running_tasks(&self) -> Vec<i64> {
        self.active.iter().map(|run| run.task_id).collect()
    }

    /// 请求取消任务的当前运行
    pub fn cancel_task(&self, task_id: i64) -> bool {
        match self.active.iter().find(|run| run.task_id == task_id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for run in self.active.iter() {
            run.cancel.cancel();
        }
    }
}

/// 持有期间占用槽位，drop 时释放
pub struct SlotGuard {
    slots: Arc<RunSlots>,
    key: SlotKey,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.active.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schedule;

    fn task(id: i64, repository_id: i64) -> BackupTask {
        let mut task = BackupTask::new("t", repository_id, vec!["/data".into()], Schedule::manual());
        task.id = id;
        task
    }

    #[test]
    fn test_repository_scope() {
        let slots = RunSlots::new(SlotScope::Repository);
        let guard = slots.try_acquire(&task(1, 10), CancellationToken::new()).unwrap();

        assert!(matches!(
            slots.try_acquire(&task(2, 10), CancellationToken::new()),
            Err(BackupError::AlreadyRunning(_))
        ));
        let other = slots.try_acquire(&task(3, 11), CancellationToken::new()).unwrap();
        assert_eq!(slots.running_tasks().len(), 2);

        drop(guard);
        assert!(!slots.is_task_running(1));
        slots.try_acquire(&task(2, 10), CancellationToken::new()).unwrap();
        drop(other);
    }

    #[test]
    fn test_global_scope() {
        let slots = RunSlots::new(SlotScope::Global);
        let _guard = slots.try_acquire(&task(1, 10), CancellationToken::new()).unwrap();
        assert!(slots.try_acquire(&task(2, 99), CancellationToken::new()).is_err());
    }

    #[test]
    fn test_task_scope_still_excludes_same_task() {
        let slots = RunSlots::new(SlotScope::Task);
        let _guard = slots.try_acquire(&task(1, 10), CancellationToken::new()).unwrap();
        assert!(slots.try_acquire(&task(1, 10), CancellationToken::new()).is_err());
        assert!(slots.try_acquire(&task(2, 10), CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_cancel_task() {
        let slots = RunSlots::new(SlotScope::Repository);
        let token = CancellationToken::new();
        let _guard = slots.try_acquire(&task(1, 10), token.clone()).unwrap();

        assert!(!slots.cancel_task(2));
        assert!(slots.cancel_task(1));
        assert!(token.is_cancelled());
    }
}
