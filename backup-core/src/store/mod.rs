//! 持久化接口
//!
//! 协调器只依赖 [`TaskStore`]，默认实现为基于 DuckDB 的 [`DuckDbStore`]。

mod database;
mod duckdb_store;

pub use database::{CURRENT_SCHEMA_VERSION, DatabaseManager};
pub use duckdb_store::DuckDbStore;

use crate::error::Result;
use crate::models::{BackupTask, Repository, RunResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait TaskStore: Send + Sync {
    // 仓库
    async fn insert_repository(&self, repository: &Repository) -> Result<i64>;
    async fn update_repository(&self, repository: &Repository) -> Result<()>;
    async fn delete_repository(&self, id: i64) -> Result<()>;
    async fn get_repository(&self, id: i64) -> Result<Option<Repository>>;
    async fn list_repositories(&self) -> Result<Vec<Repository>>;
    /// 将指定仓库设为默认，其余取消默认
    async fn set_default_repository(&self, id: i64) -> Result<()>;
    async fn touch_repository_backup(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    // 任务
    async fn insert_task(&self, task: &BackupTask) -> Result<i64>;
    async fn update_task(&self, task: &BackupTask) -> Result<()>;
    async fn delete_task(&self, id: i64) -> Result<()>;
    async fn get_task(&self, id: i64) -> Result<Option<BackupTask>>;
    async fn list_tasks(&self) -> Result<Vec<BackupTask>>;
    async fn list_enabled_tasks(&self) -> Result<Vec<BackupTask>>;
    async fn list_tasks_by_repository(&self, repository_id: i64) -> Result<Vec<BackupTask>>;
    async fn update_task_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    async fn update_task_next_run(&self, id: i64, next_run: Option<DateTime<Utc>>) -> Result<()>;

    // 运行记录
    async fn insert_run_result(&self, result: &RunResult) -> Result<i64>;
    /// 按开始时间倒序
    async fn list_run_results(&self, task_id: i64, limit: usize) -> Result<Vec<RunResult>>;

    // 键值设置
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn delete_setting(&self, key: &str) -> Result<()>;

    // 加密后的仓库密码
    async fn store_credential(&self, repository_id: i64, blob: &[u8]) -> Result<()>;
    async fn load_credential(&self, repository_id: i64) -> Result<Option<Vec<u8>>>;
    /// 全部已保存的密码，按仓库 id 排序
    async fn list_credentials(&self) -> Result<Vec<(i64, Vec<u8>)>>;
    async fn delete_credential(&self, repository_id: i64) -> Result<()>;
    async fn delete_all_credentials(&self) -> Result<()>;
}
