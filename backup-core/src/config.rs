use crate::constants::{cache, config, credentials, engine, scheduler};
use crate::coordinator::SlotScope;
use crate::credentials::StorageMode;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用配置结构
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub runs: RunsConfig,
}

/// 备份引擎配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// 可执行文件名或路径
    pub binary: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
}

/// 查询结果缓存配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    pub max_size_mb: u64,
    pub snapshot_ttl_minutes: u64,
    pub stats_ttl_minutes: u64,
    pub file_listing_ttl_minutes: u64,
    pub stale_after_minutes: u64,
}

/// 凭据缓存配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CredentialsConfig {
    pub storage_mode: StorageMode,
    /// 0 表示永不过期
    pub timeout_minutes: u64,
    pub sweep_interval_secs: u64,
    pub kdf_iterations: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RunsConfig {
    pub slot_scope: SlotScope,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: engine::DEFAULT_BINARY.to_string(),
            timeout_secs: engine::DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: config::DEFAULT_DATABASE_PATH.to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: scheduler::DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: cache::DEFAULT_MAX_SIZE_MB,
            snapshot_ttl_minutes: cache::DEFAULT_SNAPSHOT_TTL_MINUTES,
            stats_ttl_minutes: cache::DEFAULT_STATS_TTL_MINUTES,
            file_listing_ttl_minutes: cache::DEFAULT_FILE_LISTING_TTL_MINUTES,
            stale_after_minutes: cache::DEFAULT_STALE_AFTER_MINUTES,
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::default(),
            timeout_minutes: credentials::DEFAULT_TIMEOUT_MINUTES,
            sweep_interval_secs: credentials::DEFAULT_SWEEP_INTERVAL_SECS,
            kdf_iterations: credentials::DEFAULT_KDF_ITERATIONS,
        }
    }
}

impl AppConfig {
    /// 智能查找并加载配置文件
    /// 按优先级查找：backup.toml -> .backup.toml
    pub fn find_and_load_config() -> Result<Self> {
        for config_file in config::CONFIG_FILE_CANDIDATES {
            if Path::new(config_file).exists() {
                tracing::info!("找到配置文件: {}", config_file);
                return Self::load_from_file(config_file);
            }
        }

        // 如果没找到配置文件，创建默认配置
        tracing::warn!("未找到配置文件，创建默认配置: {}", config::DEFAULT_CONFIG_FILE);
        let default_config = Self::default();
        default_config.save_to_file(config::DEFAULT_CONFIG_FILE)?;
        Ok(default_config)
    }

    /// 从指定文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, self.to_toml_with_comments())?;
        Ok(())
    }

    /// 生成带注释的TOML配置
    fn to_toml_with_comments(&self) -> String {
        const TEMPLATE: &str = include_str!("../templates/config.toml.template");

        TEMPLATE
            .replace("{engine_binary}", &self.engine.binary)
            .replace("{engine_timeout_secs}", &self.engine.timeout_secs.to_string())
            .replace("{database_path}", &self.database.path)
            .replace(
                "{poll_interval_secs}",
                &self.scheduler.poll_interval_secs.to_string(),
            )
            .replace("{cache_max_size_mb}", &self.cache.max_size_mb.to_string())
            .replace(
                "{snapshot_ttl_minutes}",
                &self.cache.snapshot_ttl_minutes.to_string(),
            )
            .replace("{stats_ttl_minutes}", &self.cache.stats_ttl_minutes.to_string())
            .replace(
                "{file_listing_ttl_minutes}",
                &self.cache.file_listing_ttl_minutes.to_string(),
            )
            .replace(
                "{stale_after_minutes}",
                &self.cache.stale_after_minutes.to_string(),
            )
            .replace("{storage_mode}", self.credentials.storage_mode.as_str())
            .replace(
                "{credential_timeout_minutes}",
                &self.credentials.timeout_minutes.to_string(),
            )
            .replace(
                "{sweep_interval_secs}",
                &self.credentials.sweep_interval_secs.to_string(),
            )
            .replace(
                "{kdf_iterations}",
                &self.credentials.kdf_iterations.to_string(),
            )
            .replace("{slot_scope}", self.runs.slot_scope.as_str())
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.engine.binary.trim().is_empty() {
            return Err(crate::BackupError::configuration("engine.binary 不能为空"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(crate::BackupError::configuration(
                "engine.timeout_secs 必须大于 0",
            ));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(crate::BackupError::configuration(
                "scheduler.poll_interval_secs 必须大于 0",
            ));
        }
        if self.credentials.kdf_iterations == 0 {
            return Err(crate::BackupError::configuration(
                "credentials.kdf_iterations 必须大于 0",
            ));
        }
        Ok(())
    }

    /// 获取数据库文件路径
    pub fn get_database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.credentials.sweep_interval_secs.max(1))
    }
}
