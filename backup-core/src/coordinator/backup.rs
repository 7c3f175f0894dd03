use super::CoreServices;
use super::run_slot::{RunSlots, SlotScope};
use crate::engine::{EngineCommand, EngineEvent, EngineOutput};
use crate::error::{BackupError, Result};
use crate::events::CoreEvent;
use crate::models::{BackupSummary, BackupTask, Repository, RunOutcome, RunResult};
use crate::scheduler::next_run_local;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// 一次已启动的备份
pub struct RunHandle {
    task_id: i64,
    cancel: CancellationToken,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 等待运行结束，返回已保存的运行记录
    pub async fn wait(self) -> Result<RunResult> {
        Ok(self.join.await?)
    }
}

/// 备份任务管理与执行
#[derive(Clone)]
pub struct BackupCoordinator {
    services: CoreServices,
    slots: Arc<RunSlots>,
}

impl BackupCoordinator {
    pub fn new(services: CoreServices, scope: SlotScope) -> Self {
        Self {
            services,
            slots: RunSlots::new(scope),
        }
    }

    pub fn services(&self) -> &CoreServices {
        &self.services
    }

    fn schedule_for(&self, task: &BackupTask, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if task.is_scheduled() {
            next_run_local(&task.schedule, now)
        } else {
            None
        }
    }

    pub async fn create_task(&self, mut task: BackupTask) -> Result<BackupTask> {
        task.validate()?;
        self.services.repository(task.repository_id).await?;

        let now = self.services.clock.now();
        task.created_at = now;
        task.updated_at = now;
        task.last_run = None;
        task.next_run = self.schedule_for(&task, now);
        task.id = self.services.store.insert_task(&task).await?;

        info!(task_id = task.id, "创建备份任务: {}", task.name);
        self.services.cache.invalidate_repository(task.repository_id);
        self.services
            .events
            .publish(CoreEvent::TaskCreated { task_id: task.id });
        if task.next_run.is_some() {
            self.services.events.publish(CoreEvent::TaskScheduled {
                task_id: task.id,
                next_run: task.next_run,
            });
        }
        Ok(task)
    }

    /// 更新任务定义；调度方式或启用状态变化时重新计算下一次运行时间
    pub async fn update_task(&self, mut task: BackupTask) -> Result<BackupTask> {
        task.validate()?;
        let existing = self.get_task(task.id).await?;
        self.services.repository(task.repository_id).await?;

        let now = self.services.clock.now();
        task.created_at = existing.created_at;
        task.last_run = existing.last_run;
        task.updated_at = now;
        task.next_run = if !task.is_scheduled() {
            None
        } else if existing.is_scheduled()
            && existing.schedule == task.schedule
            && existing.next_run.is_some()
        {
            existing.next_run
        } else {
            self.schedule_for(&task, now)
        };
        self.services.store.update_task(&task).await?;

        self.services.cache.invalidate_repository(task.repository_id);
        if existing.repository_id != task.repository_id {
            self.services
                .cache
                .invalidate_repository(existing.repository_id);
        }
        self.services
            .events
            .publish(CoreEvent::TaskUpdated { task_id: task.id });
        if task.next_run != existing.next_run {
            self.services.events.publish(CoreEvent::TaskScheduled {
                task_id: task.id,
                next_run: task.next_run,
            });
        }
        Ok(task)
    }

    /// 删除任务，运行中的任务不能删除
    pub async fn delete_task(&self, task_id: i64) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if self.slots.is_task_running(task_id) {
            return Err(BackupError::already_running(format!(
                "任务 {task_id} 正在运行，无法删除"
            )));
        }
        self.services.store.delete_task(task_id).await?;

        info!(task_id, "删除备份任务: {}", task.name);
        self.services.cache.invalidate_repository(task.repository_id);
        self.services
            .events
            .publish(CoreEvent::TaskDeleted { task_id });
        Ok(())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<BackupTask> {
        self.services
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("任务 {task_id} 不存在")))
    }

    pub async fn list_tasks(&self) -> Result<Vec<BackupTask>> {
        self.services.store.list_tasks().await
    }

    pub async fn tasks_by_repository(&self, repository_id: i64) -> Result<Vec<BackupTask>> {
        self.services
            .store
            .list_tasks_by_repository(repository_id)
            .await
    }

    pub async fn set_enabled(&self, task_id: i64, enabled: bool) -> Result<BackupTask> {
        let mut task = self.get_task(task_id).await?;
        if task.enabled == enabled {
            return Ok(task);
        }
        task.enabled = enabled;
        self.update_task(task).await
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.slots.is_task_running(task_id)
    }

    pub fn running_tasks(&self) -> Vec<i64> {
        self.slots.running_tasks()
    }

    /// 请求取消，没有运行中的备份时返回 false
    pub fn cancel(&self, task_id: i64) -> bool {
        let cancelled = self.slots.cancel_task(task_id);
        if cancelled {
            info!(task_id, "请求取消备份");
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        self.slots.cancel_all();
    }

    /// 运行记录，按开始时间倒序
    pub async fn history(&self, task_id: i64, limit: usize) -> Result<Vec<RunResult>> {
        self.services.store.list_run_results(task_id, limit).await
    }

    pub async fn last_result(&self, task_id: i64) -> Result<Option<RunResult>> {
        Ok(self
            .services
            .store
            .list_run_results(task_id, 1)
            .await?
            .into_iter()
            .next())
    }

    /// 启动一次备份
    ///
    /// 任务或仓库不存在返回 NotFound，槽位被占用返回 AlreadyRunning，
    /// 没有可用密码返回 CredentialRequired 且不会启动引擎。
    /// 成功时 `BackupStarted` 已经发布，引擎在后台运行。
    #[instrument(skip(self))]
    pub async fn run(&self, task_id: i64) -> Result<RunHandle> {
        let task = self.get_task(task_id).await?;
        let repository = self.services.repository(task.repository_id).await?;

        let cancel = CancellationToken::new();
        let guard = self.slots.try_acquire(&task, cancel.clone())?;
        let secret = self.services.resolve_secret(repository.id).await?;

        let started_at = self.services.clock.now();
        info!(
            task_id,
            repository_id = repository.id,
            "开始备份: {}",
            task.name
        );
        self.services
            .events
            .publish(CoreEvent::BackupStarted { task_id });

        let worker = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let result = worker
                .execute_run(task, repository, secret, token, started_at)
                .await;
            drop(guard);
            result
        });

        Ok(RunHandle {
            task_id,
            cancel,
            join,
        })
    }

    async fn execute_run(
        &self,
        task: BackupTask,
        repository: Repository,
        secret: SecretString,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> RunResult {
        let task_id = task.id;
        let command = EngineCommand::Backup {
            paths: task.source_paths.clone(),
            excludes: task.exclude_patterns.clone(),
            tags: task.tags.clone(),
            options: task.options.clone(),
        };

        let events = self.services.events.clone();
        let output = self
            .services
            .engine
            .execute_streaming(&repository, &secret, &command, &cancel, |event| {
                if let EngineEvent::Status(progress) = event {
                    events.publish(CoreEvent::BackupProgress { task_id, progress });
                }
            })
            .await;

        let (outcome, summary, message, rejected) = classify(output);
        let finished_at = self.services.clock.now();

        let mut run = RunResult {
            id: 0,
            task_id,
            started_at,
            finished_at,
            outcome,
            summary,
            error: message.clone(),
        };
        self.record(&mut run, &task, repository.id).await;

        match outcome {
            RunOutcome::Success => info!(
                task_id,
                snapshot_id = run.snapshot_id().unwrap_or_default(),
                "备份完成"
            ),
            _ => warn!(
                task_id,
                outcome = outcome.as_str(),
                "备份未成功: {}",
                message.as_deref().unwrap_or_default()
            ),
        }

        self.services.events.publish(CoreEvent::BackupFinished {
            task_id,
            success: outcome.is_success(),
            outcome,
            snapshot_id: run.summary.snapshot_id.clone(),
            message,
        });
        if let Some(message) = rejected {
            self.services
                .reject_credential(repository.id, message)
                .await;
        }
        run
    }

    /// 写入失败时记录日志并发布 PersistenceFailed
    fn persistence_failed(&self, task_id: i64, what: &str, error: BackupError) {
        error!(task_id, "{}失败: {}", what, error);
        self.services.events.publish(CoreEvent::PersistenceFailed {
            task_id,
            message: format!("{what}失败: {error}"),
        });
    }

    /// 保存运行记录并更新任务和仓库状态，失败不影响运行结果
    async fn record(&self, run: &mut RunResult, task: &BackupTask, repository_id: i64) {
        let store = &self.services.store;

        match store.insert_run_result(run).await {
            Ok(id) => run.id = id,
            Err(e) => self.persistence_failed(task.id, "保存运行记录", e),
        }
        if let Err(e) = store.update_task_last_run(task.id, run.finished_at).await {
            self.persistence_failed(task.id, "更新最近运行时间", e);
        }

        // 运行期间任务可能被修改，以最新定义为准
        match store.get_task(task.id).await {
            Ok(Some(current)) if current.is_scheduled() => {
                let next = next_run_local(&current.schedule, self.services.clock.now());
                if let Err(e) = store.update_task_next_run(current.id, next).await {
                    self.persistence_failed(task.id, "更新下一次运行时间", e);
                } else {
                    self.services.events.publish(CoreEvent::TaskScheduled {
                        task_id: current.id,
                        next_run: next,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => self.persistence_failed(task.id, "读取任务", e),
        }

        if run.outcome.is_success() {
            if let Err(e) = store
                .touch_repository_backup(repository_id, run.finished_at)
                .await
            {
                self.persistence_failed(task.id, "更新仓库最近备份时间", e);
            }
            self.services.cache.invalidate_repository(repository_id);
            self.services
                .events
                .publish(CoreEvent::SnapshotsUpdated { repository_id });
        }
    }
}

/// 把引擎结果归类为运行结果、统计、错误描述和被拒绝的密码信息
fn classify(
    output: Result<EngineOutput>,
) -> (RunOutcome, BackupSummary, Option<String>, Option<String>) {
    let (summary, result) = match output {
        Ok(output) => (output.summary.clone().unwrap_or_default(), output.into_result()),
        Err(e) => (BackupSummary::default(), Err(e)),
    };

    match result {
        Ok(_) => (RunOutcome::Success, summary, None, None),
        Err(BackupError::Cancelled) => (
            RunOutcome::Cancelled,
            summary,
            Some("备份已取消".to_string()),
            None,
        ),
        Err(e @ BackupError::ProcessTimeout { .. }) => {
            (RunOutcome::TimedOut, summary, Some(e.to_string()), None)
        }
        Err(BackupError::CredentialRejected { message, .. }) => (
            RunOutcome::Failed,
            summary,
            Some(message.clone()),
            Some(message),
        ),
        Err(e) => (RunOutcome::Failed, summary, Some(e.to_string()), None),
    }
}
