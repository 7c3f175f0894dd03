use super::TaskStore;
use super::database::DatabaseManager;
use crate::error::{BackupError, Result};
use crate::models::{
    BackendType, BackupSummary, BackupTask, EngineOptions, Repository, RunResult, Schedule,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{OptionalExt, Row, params};
use std::collections::BTreeMap;
use std::path::Path;

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(ts)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BackupError::persistence(format!("无效的时间格式 {value}: {e}")))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| parse_ts(&v))
        .transpose()
}

const REPOSITORY_COLUMNS: &str =
    "id, name, backend, path, config_json, is_default, created_at, last_backup";

struct RepositoryRow {
    id: i64,
    name: String,
    backend: String,
    path: String,
    config_json: String,
    is_default: bool,
    created_at: String,
    last_backup: Option<String>,
}

impl RepositoryRow {
    fn read(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            backend: row.get(2)?,
            path: row.get(3)?,
            config_json: row.get(4)?,
            is_default: row.get(5)?,
            created_at: row.get(6)?,
            last_backup: row.get(7)?,
        })
    }

    fn into_model(self) -> Result<Repository> {
        let config: BTreeMap<String, String> = serde_json::from_str(&self.config_json)?;
        Ok(Repository {
            id: self.id,
            name: self.name,
            backend: self.backend.parse::<BackendType>()?,
            path: self.path,
            config,
            created_at: parse_ts(&self.created_at)?,
            last_backup: parse_opt_ts(self.last_backup)?,
            is_default: self.is_default,
        })
    }
}

const TASK_COLUMNS: &str = "id, name, repository_id, source_paths_json, exclude_patterns_json, \
     tags_json, schedule_json, enabled, description, created_at, updated_at, last_run, next_run, \
     options_json";

struct TaskRow {
    id: i64,
    name: String,
    repository_id: i64,
    source_paths_json: String,
    exclude_patterns_json: String,
    tags_json: String,
    schedule_json: String,
    enabled: bool,
    description: Option<String>,
    created_at: String,
    updated_at: String,
    last_run: Option<String>,
    next_run: Option<String>,
    options_json: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            repository_id: row.get(2)?,
            source_paths_json: row.get(3)?,
            exclude_patterns_json: row.get(4)?,
            tags_json: row.get(5)?,
            schedule_json: row.get(6)?,
            enabled: row.get(7)?,
            description: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            last_run: row.get(11)?,
            next_run: row.get(12)?,
            options_json: row.get(13)?,
        })
    }

    fn into_model(self) -> Result<BackupTask> {
        let schedule: Schedule = serde_json::from_str(&self.schedule_json)?;
        // 旧版本没有 options_json 列
        let options: EngineOptions = match self.options_json.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => EngineOptions::default(),
        };
        Ok(BackupTask {
            id: self.id,
            name: self.name,
            repository_id: self.repository_id,
            source_paths: serde_json::from_str(&self.source_paths_json)?,
            exclude_patterns: serde_json::from_str(&self.exclude_patterns_json)?,
            tags: serde_json::from_str(&self.tags_json)?,
            schedule,
            enabled: self.enabled,
            description: self.description,
            options,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_run: parse_opt_ts(self.last_run)?,
            next_run: parse_opt_ts(self.next_run)?,
        })
    }
}

/// 任务写入数据库时的序列化字段
struct TaskColumns {
    source_paths: String,
    exclude_patterns: String,
    tags: String,
    schedule: String,
    options: String,
}

impl TaskColumns {
    fn from_task(task: &BackupTask) -> Result<Self> {
        Ok(Self {
            source_paths: serde_json::to_string(&task.source_paths)?,
            exclude_patterns: serde_json::to_string(&task.exclude_patterns)?,
            tags: serde_json::to_string(&task.tags)?,
            schedule: serde_json::to_string(&task.schedule)?,
            options: serde_json::to_string(&task.options)?,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, task_id, started_at, finished_at, outcome, snapshot_id, summary_json, error";

struct RunRow {
    id: i64,
    task_id: i64,
    started_at: String,
    finished_at: String,
    outcome: String,
    snapshot_id: Option<String>,
    summary_json: String,
    error: Option<String>,
}

impl RunRow {
    fn read(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            outcome: row.get(4)?,
            snapshot_id: row.get(5)?,
            summary_json: row.get(6)?,
            error: row.get(7)?,
        })
    }

    fn into_model(self) -> Result<RunResult> {
        let mut summary: BackupSummary = serde_json::from_str(&self.summary_json)?;
        if summary.snapshot_id.is_none() {
            summary.snapshot_id = self.snapshot_id;
        }
        Ok(RunResult {
            id: self.id,
            task_id: self.task_id,
            started_at: parse_ts(&self.started_at)?,
            finished_at: parse_ts(&self.finished_at)?,
            outcome: self.outcome.parse()?,
            summary,
            error: self.error,
        })
    }
}

fn ensure_found(affected: usize, what: &str, id: i64) -> Result<()> {
    if affected == 0 {
        Err(BackupError::not_found(format!("{what} {id}")))
    } else {
        Ok(())
    }
}

/// 基于 DuckDB 的持久化实现
#[derive(Clone)]
pub struct DuckDbStore {
    db: DatabaseManager,
}

impl DuckDbStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: DatabaseManager::new(path).await?,
        })
    }

    pub async fn new_memory() -> Result<Self> {
        Ok(Self {
            db: DatabaseManager::new_memory().await?,
        })
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    async fn query_tasks(&self, filter: &str, param: Option<i64>) -> Result<Vec<BackupTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM backup_tasks {filter} ORDER BY id");
        let rows = self
            .db
            .read_with_retry(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = match param {
                    Some(value) => stmt.query_map([value], TaskRow::read)?,
                    None => stmt.query_map([], TaskRow::read)?,
                };
                rows.collect::<duckdb::Result<Vec<_>>>()
            })
            .await?;
        rows.into_iter().map(TaskRow::into_model).collect()
    }
}

#[async_trait]
impl TaskStore for DuckDbStore {
    async fn insert_repository(&self, repository: &Repository) -> Result<i64> {
        let config = serde_json::to_string(&repository.config)?;
        let created_at = ts(&repository.created_at);
        let last_backup = opt_ts(&repository.last_backup);
        self.db
            .write_with_retry(|conn| {
                conn.query_row(
                    "INSERT INTO repositories (name, backend, path, config_json, is_default, created_at, last_backup)
                     VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
                    params![
                        repository.name,
                        repository.backend.as_str(),
                        repository.path,
                        config,
                        repository.is_default,
                        created_at,
                        last_backup
                    ],
                    |row| row.get(0),
                )
            })
            .await
    }

    async fn update_repository(&self, repository: &Repository) -> Result<()> {
        let config = serde_json::to_string(&repository.config)?;
        let last_backup = opt_ts(&repository.last_backup);
        let affected = self
            .db
            .write_with_retry(|conn| {
                conn.execute(
                    "UPDATE repositories SET name = ?, backend = ?, path = ?, config_json = ?,
                     is_default = ?, last_backup = ? WHERE id = ?",
                    params![
                        repository.name,
                        repository.backend.as_str(),
                        repository.path,
                        config,
                        repository.is_default,
                        last_backup,
                        repository.id
                    ],
                )
            })
            .await?;
        ensure_found(affected, "仓库", repository.id)
    }

    async fn delete_repository(&self, id: i64) -> Result<()> {
        let affected = self
            .db
            .write_with_retry(|conn| conn.execute("DELETE FROM repositories WHERE id = ?", [id]))
            .await?;
        ensure_found(affected, "仓库", id)
    }

    async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = ?");
        let row = self
            .db
            .read_with_retry(|conn| conn.query_row(&sql, [id], RepositoryRow::read).optional())
            .await?;
        row.map(RepositoryRow::into_model).transpose()
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY id");
        let rows = self
            .db
            .read_with_retry(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], RepositoryRow::read)?;
                rows.collect::<duckdb::Result<Vec<_>>>()
            })
            .await?;
        rows.into_iter().map(RepositoryRow::into_model).collect()
    }

    async fn set_default_repository(&self, id: i64) -> Result<()> {
        if self.get_repository(id).await?.is_none() {
            return Err(BackupError::not_found(format!("仓库 {id}")));
        }
        self.db
            .write_with_retry(|conn| {
                conn.execute("UPDATE repositories SET is_default = (id = ?)", [id])
            })
            .await?;
        Ok(())
    }

    async fn touch_repository_backup(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = ts(&at);
        let affected = self
            .db
            .write_with_retry(|conn| {
                conn.execute(
                    "UPDATE repositories SET last_backup = ? WHERE id = ?",
                    params![at, id],
                )
            })
            .await?;
        ensure_found(affected, "仓库", id)
    }

    async fn insert_task(&self, task: &BackupTask) -> Result<i64> {
        let columns = TaskColumns::from_task(task)?;
        let created_at = ts(&task.created_at);
        let updated_at = ts(&task.updated_at);
        let last_run = opt_ts(&task.last_run);
        let next_run = opt_ts(&task.next_run);
        self.db
            .write_with_retry(|conn| {
                conn.query_row(
                    "INSERT INTO backup_tasks (name, repository_id, source_paths_json, exclude_patterns_json,
                     tags_json, schedule_json, enabled, description, created_at, updated_at, last_run,
                     next_run, options_json)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
                    params![
                        task.name,
                        task.repository_id,
                        columns.source_paths,
                        columns.exclude_patterns,
                        columns.tags,
                        columns.schedule,
                        task.enabled,
                        task.description,
                        created_at,
                        updated_at,
                        last_run,
                        next_run,
                        columns.options
                    ],
                    |row| row.get(0),
                )
            })
            .await
    }

    async fn update_task(&self, task: &BackupTask) -> Result<()> {
        let columns = TaskColumns::from_task(task)?;
        let updated_at = ts(&task.updated_at);
        let last_run = opt_ts(&task.last_run);
        let next_run = opt_ts(&task.next_run);
        let affected = self
            .db
            .write_with_retry(|conn| {
                conn.execute(
                    "UPDATE backup_tasks SET name = ?, repository_id = ?, source_paths_json = ?,
                     exclude_patterns_json = ?, tags_json = ?, schedule_json = ?, enabled = ?,
                     description = ?, updated_at = ?, last_run = ?, next_run = ?, options_json = ?
                     WHERE id = ?",
                    params![
                        task.name,
                        task.repository_id,
                        columns.source_paths,
                        columns.exclude_patterns,
                        columns.tags,
                        columns.schedule,
                        task.enabled,
                        task.description,
                        updated_at,
                        last_run,
                        next_run,
                        columns.options,
                        task.id
                    ],
                )
            })
            .await?;
        ensure_found(affected, "任务", task.id)
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        let affected = self
            .db
            .write_with_retry(|conn| conn.execute("DELETE FROM backup_tasks WHERE id = ?", [id]))
            .await?;
        ensure_found(affected, "任务", id)
    }

    async fn get_task(&self, id: i64) -> Result<Option<BackupTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM backup_tasks WHERE id = ?");
        let row = self
            .db
            .read_with_retry(|conn| conn.query_row(&sql, [id], TaskRow::read).optional())
            .await?;
        row.map(TaskRow::into_model).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<BackupTask>> {
        self.query_tasks("", None).await
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<BackupTask>> {
        self.query_tasks("WHERE enabled = TRUE", None).await
    }

    async fn list_tasks_by_repository(&self, repository_id: i64) -> Result<Vec<BackupTask>> {
        self.query_tasks("WHERE repository_id = ?", Some(repository_id))
            .await
    }

    async fn update_task_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = ts(&at);
        let affected = self
            .db
            .write_with_retry(|conn| {
                conn.execute(
                    "UPDATE backup_tasks SET last_run = ? WHERE id = ?",
                    params![at, id],
                )
            })
            .await?;
        ensure_found(affected, "任务", id)
    }

    async fn update_task_next_run(&self, id: i64, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let next_run = opt_ts(&next_run);
        let affected = self
            .db
            .write_with_retry(|conn| {
                conn.execute(
                    "UPDATE backup_tasks SET next_run = ? WHERE id = ?",
                    params![next_run, id],
                )
            })
            .await?;
        ensure_found(affected, "任务", id)
    }

    async fn insert_run_result(&self, result: &RunResult) -> Result<i64> {
        let summary = serde_json::to_string(&result.summary)?;
        let started_at = ts(&result.started_at);
        let finished_at = ts(&result.finished_at);
        self.db
            .write_with_retry(|conn| {
                conn.query_row(
                    "INSERT INTO run_results (task_id, started_at, finished_at, outcome, snapshot_id,
                     summary_json, error) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
                    params![
                        result.task_id,
                        started_at,
                        finished_at,
                        result.outcome.as_str(),
                        result.summary.snapshot_id,
                        summary,
                        result.error
                    ],
                    |row| row.get(0),
                )
            })
            .await
    }

    async fn list_run_results(&self, task_id: i64, limit: usize) -> Result<Vec<RunResult>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM run_results WHERE task_id = ? ORDER BY started_at DESC, id DESC LIMIT ?"
        );
        let limit = limit as i64;
        let rows = self
            .db
            .read_with_retry(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![task_id, limit], RunRow::read)?;
                rows.collect::<duckdb::Result<Vec<_>>>()
            })
            .await?;
        rows.into_iter().map(RunRow::into_model).collect()
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.db
            .read_with_retry(|conn| {
                conn.query_row("SELECT value FROM settings WHERE key = ?", [key], |row| {
                    row.get(0)
                })
                .optional()
            })
            .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = ts(&Utc::now());
        self.db
            .write_with_retry(|conn| {
                conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, value, now],
                )
            })
            .await?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        self.db
            .write_with_retry(|conn| conn.execute("DELETE FROM settings WHERE key = ?", [key]))
            .await?;
        Ok(())
    }

    async fn store_credential(&self, repository_id: i64, blob: &[u8]) -> Result<()> {
        let now = ts(&Utc::now());
        self.db
            .write_with_retry(|conn| {
                conn.execute(
                    "INSERT INTO credentials (repository_id, secret_blob, updated_at) VALUES (?, ?, ?)
                     ON CONFLICT (repository_id) DO UPDATE SET secret_blob = excluded.secret_blob,
                     updated_at = excluded.updated_at",
                    params![repository_id, blob, now],
                )
            })
            .await?;
        Ok(())
    }

    async fn load_credential(&self, repository_id: i64) -> Result<Option<Vec<u8>>> {
        self.db
            .read_with_retry(|conn| {
                conn.query_row(
                    "SELECT secret_blob FROM credentials WHERE repository_id = ?",
                    [repository_id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    async fn list_credentials(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        self.db
            .read_with_retry(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT repository_id, secret_blob FROM credentials ORDER BY repository_id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<duckdb::Result<Vec<_>>>()
            })
            .await
    }

    async fn delete_credential(&self, repository_id: i64) -> Result<()> {
        self.db
            .write_with_retry(|conn| {
                conn.execute(
                    "DELETE FROM credentials WHERE repository_id = ?",
                    [repository_id],
                )
            })
            .await?;
        Ok(())
    }

    async fn delete_all_credentials(&self) -> Result<()> {
        self.db
            .write_with_retry(|conn| conn.execute("DELETE FROM credentials", []))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunOutcome, Schedule};
    use chrono::{NaiveTime, TimeZone};

    async fn store_with_repo() -> (DuckDbStore, i64) {
        let store = DuckDbStore::new_memory().await.unwrap();
        let repo = Repository::new("本地仓库", BackendType::Local, "/srv/repo");
        let id = store.insert_repository(&repo).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_repository_crud() {
        let (store, id) = store_with_repo().await;

        let mut repo = store.get_repository(id).await.unwrap().unwrap();
        assert_eq!(repo.name, "本地仓库");
        assert_eq!(repo.backend, BackendType::Local);
        assert!(repo.last_backup.is_none());

        repo.config.insert("bucket".into(), "b".into());
        repo.name = "改名".into();
        store.update_repository(&repo).await.unwrap();
        let loaded = store.get_repository(id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "改名");
        assert_eq!(loaded.config.get("bucket").map(String::as_str), Some("b"));

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store.touch_repository_backup(id, at).await.unwrap();
        assert_eq!(
            store.get_repository(id).await.unwrap().unwrap().last_backup,
            Some(at)
        );

        store.delete_repository(id).await.unwrap();
        assert!(store.get_repository(id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_repository(id).await,
            Err(BackupError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_default_repository_is_exclusive() {
        let (store, first) = store_with_repo().await;
        let second = store
            .insert_repository(&Repository::new("第二个", BackendType::Local, "/srv/b"))
            .await
            .unwrap();

        store.set_default_repository(first).await.unwrap();
        store.set_default_repository(second).await.unwrap();

        let repos = store.list_repositories().await.unwrap();
        let defaults: Vec<i64> = repos.iter().filter(|r| r.is_default).map(|r| r.id).collect();
        assert_eq!(defaults, vec![second]);
        assert!(store.set_default_repository(999).await.is_err());
    }

    #[tokio::test]
    async fn test_task_roundtrip_through_store() {
        let (store, repo_id) = store_with_repo().await;
        let mut task = BackupTask::new(
            "夜间备份",
            repo_id,
            vec!["/home".into()],
            Schedule::daily(NaiveTime::from_hms_opt(2, 0, 0).unwrap()),
        );
        task.description = Some(String::new());
        task.tags = vec!["nightly".into()];
        task.options.exclude_caches = true;
        task.created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        task.updated_at = task.created_at;

        let id = store.insert_task(&task).await.unwrap();
        task.id = id;
        assert_eq!(store.get_task(id).await.unwrap(), Some(task.clone()));

        let next = Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 0).unwrap();
        store.update_task_next_run(id, Some(next)).await.unwrap();
        store.update_task_last_run(id, next).await.unwrap();
        let loaded = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(loaded.next_run, Some(next));
        assert_eq!(loaded.last_run, Some(next));

        task.enabled = false;
        task.description = None;
        store.update_task(&task).await.unwrap();
        let loaded = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(loaded.description, None);
        assert!(store.list_enabled_tasks().await.unwrap().is_empty());
        assert_eq!(store.list_tasks_by_repository(repo_id).await.unwrap().len(), 1);
        assert!(store.list_tasks_by_repository(repo_id + 1).await.unwrap().is_empty());

        store.delete_task(id).await.unwrap();
        assert!(store.get_task(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_results_newest_first() {
        let (store, _) = store_with_repo().await;
        for (hour, outcome) in [(1, RunOutcome::Success), (3, RunOutcome::Failed), (2, RunOutcome::Cancelled)] {
            let started_at = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
            let result = RunResult {
                id: 0,
                task_id: 5,
                started_at,
                finished_at: started_at + chrono::Duration::minutes(3),
                outcome,
                summary: BackupSummary {
                    snapshot_id: Some(format!("snap-{hour}")),
                    files_new: hour as u64,
                    ..BackupSummary::default()
                },
                error: (outcome == RunOutcome::Failed).then(|| "boom".to_string()),
            };
            store.insert_run_result(&result).await.unwrap();
        }

        let results = store.list_run_results(5, 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, RunOutcome::Failed);
        assert_eq!(results[0].error.as_deref(), Some("boom"));
        assert_eq!(results[1].snapshot_id(), Some("snap-2"));
        assert!(store.list_run_results(6, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_and_credentials() {
        let (store, repo_id) = store_with_repo().await;

        assert_eq!(store.get_setting("k").await.unwrap(), None);
        store.set_setting("k", "v1").await.unwrap();
        store.set_setting("k", "v2").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("v2"));
        store.delete_setting("k").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap(), None);

        store.store_credential(repo_id, &[1, 2, 3]).await.unwrap();
        store.store_credential(repo_id, &[4, 5]).await.unwrap();
        assert_eq!(store.load_credential(repo_id).await.unwrap(), Some(vec![4, 5]));
        store.store_credential(repo_id + 1, &[9]).await.unwrap();

        assert_eq!(
            store.list_credentials().await.unwrap(),
            vec![(repo_id, vec![4, 5]), (repo_id + 1, vec![9])]
        );
        store.delete_credential(repo_id).await.unwrap();
        assert_eq!(store.load_credential(repo_id).await.unwrap(), None);
        store.delete_all_credentials().await.unwrap();
        assert_eq!(store.load_credential(repo_id + 1).await.unwrap(), None);
    }
}
