use super::schedule::Schedule;
use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 备份任务定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTask {
    /// 未保存时为 0
    pub id: i64,
    pub name: String,
    pub repository_id: i64,
    pub source_paths: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub schedule: Schedule,
    pub enabled: bool,
    pub description: Option<String>,
    #[serde(default)]
    pub options: EngineOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// 传给引擎的高级参数
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub one_file_system: bool,
    pub exclude_caches: bool,
    /// 例如 "2G"
    pub exclude_larger_than: Option<String>,
    /// auto / off / max
    pub compression: Option<String>,
    pub read_concurrency: Option<u32>,
    pub host: Option<String>,
    pub extra_args: Vec<String>,
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(compression) = &self.compression {
            if !matches!(compression.as_str(), "auto" | "off" | "max") {
                return Err(BackupError::invalid_input(format!(
                    "不支持的压缩模式: {compression}"
                )));
            }
        }
        if self.read_concurrency == Some(0) {
            return Err(BackupError::invalid_input("read_concurrency 必须大于 0"));
        }
        // 密码只能通过环境变量传递
        if let Some(arg) = self.extra_args.iter().find(|arg| carries_password(arg)) {
            return Err(BackupError::invalid_input(format!(
                "附加参数不能携带密码: {arg}"
            )));
        }
        Ok(())
    }

    /// 转换为引擎命令行参数
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.one_file_system {
            args.push("--one-file-system".to_string());
        }
        if self.exclude_caches {
            args.push("--exclude-caches".to_string());
        }
        if let Some(size) = &self.exclude_larger_than {
            args.push("--exclude-larger-than".to_string());
            args.push(size.clone());
        }
        if let Some(compression) = &self.compression {
            args.push("--compression".to_string());
            args.push(compression.clone());
        }
        if let Some(n) = self.read_concurrency {
            args.push("--read-concurrency".to_string());
            args.push(n.to_string());
        }
        if let Some(host) = &self.host {
            args.push("--host".to_string());
            args.push(host.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// `--password-file`、`--password-command` 以及短参数 `-p`
fn carries_password(arg: &str) -> bool {
    let arg = arg.trim();
    arg.to_ascii_lowercase().contains("password")
        || (arg.starts_with("-p") && !arg.starts_with("--"))
}

impl BackupTask {
    pub fn new(
        name: impl Into<String>,
        repository_id: i64,
        source_paths: Vec<String>,
        schedule: Schedule,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            repository_id,
            source_paths,
            exclude_patterns: Vec::new(),
            tags: Vec::new(),
            schedule,
            enabled: true,
            description: None,
            options: EngineOptions::default(),
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BackupError::invalid_input("任务名称不能为空"));
        }
        if self.source_paths.iter().all(|p| p.trim().is_empty()) {
            return Err(BackupError::invalid_input("至少需要一个备份路径"));
        }
        self.options.validate()
    }

    /// 是否由调度器触发
    pub fn is_scheduled(&self) -> bool {
        self.enabled && self.schedule.is_schedulable()
    }
}
