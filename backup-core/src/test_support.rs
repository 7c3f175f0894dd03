use crate::error::{BackupError, Result};
use crate::models::{BackupTask, Repository, RunResult};
use crate::store::{DuckDbStore, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// 在目录中写入一个假的备份引擎脚本，每次调用会在 invocations 文件追加一行
#[cfg(unix)]
pub fn fake_engine(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("restic");
    let log = dir.join("invocations");
    let script = format!(
        "#!/bin/sh\necho \"$*\" >> \"{}\"\n{}\n",
        log.display(),
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// 假引擎被调用的次数
pub fn invocation_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("invocations"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// 假引擎每次调用的参数
pub fn invocations(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("invocations"))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// 包装 DuckDbStore，可以让指定操作返回持久化错误
pub struct FailingStore {
    inner: Arc<DuckDbStore>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FailingStore {
    pub fn new(inner: Arc<DuckDbStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// 之后对 `operation` 的调用都会失败
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.failing.lock().unwrap().contains(operation) {
            return Err(BackupError::persistence(format!("{operation} 写入失败")));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FailingStore {
    async fn insert_repository(&self, repository: &Repository) -> Result<i64> {
        self.check("insert_repository")?;
        self.inner.insert_repository(repository).await
    }

    async fn update_repository(&self, repository: &Repository) -> Result<()> {
        self.check("update_repository")?;
        self.inner.update_repository(repository).await
    }

    async fn delete_repository(&self, id: i64) -> Result<()> {
        self.check("delete_repository")?;
        self.inner.delete_repository(id).await
    }

    async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        self.check("get_repository")?;
        self.inner.get_repository(id).await
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        self.check("list_repositories")?;
        self.inner.list_repositories().await
    }

    async fn set_default_repository(&self, id: i64) -> Result<()> {
        self.check("set_default_repository")?;
        self.inner.set_default_repository(id).await
    }

    async fn touch_repository_backup(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.check("touch_repository_backup")?;
        self.inner.touch_repository_backup(id, at).await
    }

    async fn insert_task(&self, task: &BackupTask) -> Result<i64> {
        self.check("insert_task")?;
        self.inner.insert_task(task).await
    }

    async fn update_task(&self, task: &BackupTask) -> Result<()> {
        self.check("update_task")?;
        self.inner.update_task(task).await
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        self.check("delete_task")?;
        self.inner.delete_task(id).await
    }

    async fn get_task(&self, id: i64) -> Result<Option<BackupTask>> {
        self.check("get_task")?;
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self) -> Result<Vec<BackupTask>> {
        self.check("list_tasks")?;
        self.inner.list_tasks().await
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<BackupTask>> {
        self.check("list_enabled_tasks")?;
        self.inner.list_enabled_tasks().await
    }

    async fn list_tasks_by_repository(&self, repository_id: i64) -> Result<Vec<BackupTask>> {
        self.check("list_tasks_by_repository")?;
        self.inner.list_tasks_by_repository(repository_id).await
    }

    async fn update_task_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.check("update_task_last_run")?;
        self.inner.update_task_last_run(id, at).await
    }

    async fn update_task_next_run(&self, id: i64, next_run: Option<DateTime<Utc>>) -> Result<()> {
        self.check("update_task_next_run")?;
        self.inner.update_task_next_run(id, next_run).await
    }

    async fn insert_run_result(&self, result: &RunResult) -> Result<i64> {
        self.check("insert_run_result")?;
        self.inner.insert_run_result(result).await
    }

    async fn list_run_results(&self, task_id: i64, limit: usize) -> Result<Vec<RunResult>> {
        self.check("list_run_results")?;
        self.inner.list_run_results(task_id, limit).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.check("get_setting")?;
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check("set_setting")?;
        self.inner.set_setting(key, value).await
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        self.check("delete_setting")?;
        self.inner.delete_setting(key).await
    }

    async fn store_credential(&self, repository_id: i64, blob: &[u8]) -> Result<()> {
        self.check("store_credential")?;
        self.inner.store_credential(repository_id, blob).await
    }

    async fn load_credential(&self, repository_id: i64) -> Result<Option<Vec<u8>>> {
        self.check("load_credential")?;
        self.inner.load_credential(repository_id).await
    }

    async fn list_credentials(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        self.check("list_credentials")?;
        self.inner.list_credentials().await
    }

    async fn delete_credential(&self, repository_id: i64) -> Result<()> {
        self.check("delete_credential")?;
        self.inner.delete_credential(repository_id).await
    }

    async fn delete_all_credentials(&self) -> Result<()> {
        self.check("delete_all_credentials")?;
        self.inner.delete_all_credentials().await
    }
}
