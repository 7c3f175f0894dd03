use crate::error::{BackupError, Result};
use duckdb::{Connection, Result as DuckResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 最新的表结构版本，与 migrations/init_duckdb.sql 对应
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// 旧版本升级步骤，只允许新增列或表
const UPGRADES: &[(i32, &[&str])] = &[
    (
        2,
        &[
            "ALTER TABLE backup_tasks ADD COLUMN IF NOT EXISTS last_run VARCHAR",
            "ALTER TABLE backup_tasks ADD COLUMN IF NOT EXISTS next_run VARCHAR",
        ],
    ),
    (
        3,
        &[
            "ALTER TABLE backup_tasks ADD COLUMN IF NOT EXISTS options_json VARCHAR",
            "CREATE SEQUENCE IF NOT EXISTS run_results_id_seq START 1",
            "CREATE TABLE IF NOT EXISTS run_results (
                id BIGINT PRIMARY KEY DEFAULT nextval('run_results_id_seq'),
                task_id BIGINT NOT NULL,
                started_at VARCHAR NOT NULL,
                finished_at VARCHAR NOT NULL,
                outcome VARCHAR NOT NULL,
                snapshot_id VARCHAR,
                summary_json VARCHAR NOT NULL DEFAULT '{}',
                error VARCHAR
            )",
            "CREATE TABLE IF NOT EXISTS credentials (
                repository_id BIGINT PRIMARY KEY,
                secret_blob BLOB NOT NULL,
                updated_at VARCHAR NOT NULL
            )",
        ],
    ),
];

const MAX_RETRIES: u32 = 3;

/// DuckDB 连接管理
///
/// - 文件库和内存库都只打开一个数据库实例，每个操作从中克隆连接
/// - 写操作在互斥锁内串行执行，避免 write-write conflict
/// - 冲突类错误按指数退避重试
#[derive(Clone)]
pub struct DatabaseManager {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// None 表示内存数据库
    db_path: Option<PathBuf>,
    connection: Mutex<Connection>,
}

impl DatabaseManager {
    /// 打开文件数据库
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connection = Connection::open(&db_path)?;
        debug!("数据库文件已打开: {:?}", db_path);

        let manager = Self {
            inner: Arc::new(DatabaseInner {
                db_path: Some(db_path),
                connection: Mutex::new(connection),
            }),
        };
        manager.initialize_schema().await?;
        Ok(manager)
    }

    /// 内存数据库（主要用于测试）
    pub async fn new_memory() -> Result<Self> {
        let manager = Self::open_memory_unmigrated()?;
        manager.initialize_schema().await?;
        Ok(manager)
    }

    fn open_memory_unmigrated() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        debug!("内存数据库连接创建成功");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                db_path: None,
                connection: Mutex::new(connection),
            }),
        })
    }

    pub fn is_memory(&self) -> bool {
        self.inner.db_path.is_none()
    }

    fn is_retryable_error(error_msg: &str) -> bool {
        error_msg.contains("write-write conflict")
            || error_msg.contains("database is locked")
            || error_msg.contains("database is busy")
            || error_msg.contains("Conflict on tuple deletion")
    }

    /// 读操作：克隆一个独立连接执行，不占用写锁
    pub async fn read_with_retry<F, R>(&self, operation: F) -> Result<R>
    where
        F: Fn(&Connection) -> DuckResult<R> + Send + Sync,
        R: Send,
    {
        let mut attempt = 0;
        loop {
            let conn = {
                let base = self.inner.connection.lock().await;
                base.try_clone()?
            };

            match operation(&conn) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let error_msg = e.to_string();
                    if Self::is_retryable_error(&error_msg) && attempt < MAX_RETRIES {
                        attempt += 1;
                        let delay = Duration::from_millis(100 * attempt as u64);
                        warn!(
                            "读操作失败，{}ms后重试 ({}/{}): {}",
                            delay.as_millis(),
                            attempt,
                            MAX_RETRIES,
                            error_msg
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    error!("读操作失败: {}", error_msg);
                    return Err(e.into());
                }
            }
        }
    }

    /// 写操作：持有写锁串行执行
    pub async fn write_with_retry<F, R>(&self, operation: F) -> Result<R>
    where
        F: Fn(&Connection) -> DuckResult<R> + Send + Sync,
        R: Send,
    {
        let mut attempt = 0;
        loop {
            let conn = self.inner.connection.lock().await;
            match operation(&conn) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let error_msg = e.to_string();
                    if Self::is_retryable_error(&error_msg) && attempt < MAX_RETRIES {
                        attempt += 1;
                        let delay = Duration::from_millis(100 * (1 << attempt));
                        warn!(
                            "写操作冲突，{}ms后重试 ({}/{}): {}",
                            delay.as_millis(),
                            attempt,
                            MAX_RETRIES,
                            error_msg
                        );
                        drop(conn);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    error!("写操作失败: {}", error_msg);
                    return Err(e.into());
                }
            }
        }
    }

    /// 初始化或升级表结构
    pub async fn initialize_schema(&self) -> Result<()> {
        self.write_with_retry(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )",
                [],
            )?;
            Ok(())
        })
        .await?;

        let current = self.schema_version().await?;
        let legacy = current.is_none() && self.table_exists("backup_tasks").await?;

        match (current, legacy) {
            (None, false) => {
                info!("创建数据库表结构 (版本 {})", CURRENT_SCHEMA_VERSION);
                let schema_sql = include_str!("../../migrations/init_duckdb.sql");
                let statements = split_sql_statements(schema_sql);
                self.write_with_retry(|conn| {
                    for statement in &statements {
                        debug!("执行SQL语句: {}", preview(statement));
                        if let Err(e) = conn.execute(statement, []) {
                            error!("SQL语句执行失败: {}, 语句: {}", e, statement);
                            return Err(e);
                        }
                    }
                    conn.execute(
                        "INSERT INTO schema_version (version) VALUES (?)",
                        [CURRENT_SCHEMA_VERSION],
                    )?;
                    Ok(())
                })
                .await?;
            }
            (current, _) => {
                // 没有版本记录但已有业务表，视为最早的版本
                let from = current.unwrap_or(1);
                self.upgrade_from(from).await?;
            }
        }

        debug!("数据库表结构初始化完成");
        Ok(())
    }

    async fn upgrade_from(&self, from: i32) -> Result<()> {
        if from > CURRENT_SCHEMA_VERSION {
            return Err(BackupError::persistence(format!(
                "数据库版本 {from} 高于程序支持的版本 {CURRENT_SCHEMA_VERSION}"
            )));
        }

        for (version, statements) in UPGRADES.iter().filter(|(v, _)| *v > from) {
            info!("升级数据库表结构: {} -> {}", version - 1, version);
            self.write_with_retry(|conn| {
                for statement in statements.iter() {
                    conn.execute(statement, [])?;
                }
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?) ON CONFLICT DO NOTHING",
                    [*version],
                )?;
                Ok(())
            })
            .await?;
        }

        if from < CURRENT_SCHEMA_VERSION {
            // 版本 1 没有 schema_version 记录
            self.write_with_retry(|conn| {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (1) ON CONFLICT DO NOTHING",
                    [],
                )?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// 当前表结构版本，没有记录时为 None
    pub async fn schema_version(&self) -> Result<Option<i32>> {
        self.read_with_retry(|conn| {
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<i32>>(0)
            })
        })
        .await
    }

    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        self.read_with_retry(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM duckdb_tables() WHERE table_name = ?",
                [table_name],
                |row| {
                    let count: i64 = row.get(0)?;
                    Ok(count > 0)
                },
            )
        })
        .await
    }
}

fn preview(statement: &str) -> String {
    if statement.len() <= 100 {
        return statement.to_string();
    }
    let mut end = 100;
    while end > 0 && !statement.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &statement[..end])
}

/// 按分号拆分 SQL 脚本，忽略字符串内的分号和纯注释片段
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;

    for line in sql.lines() {
        let trimmed = line.trim_start();
        if !in_string && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' => {
                    in_string = !in_string;
                    current.push(ch);
                }
                ';' if !in_string => {
                    if !current.trim().is_empty() {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        current.push('\n');
    }

    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}
