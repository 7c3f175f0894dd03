use anyhow::{Context, Result};
use backup_core::{
    BackupError,
    cache::QueryResultCache,
    clock::{Clock, SystemClock},
    config::AppConfig,
    coordinator::{
        BackupCoordinator, CoreServices, RepositoryCoordinator, RestoreCoordinator,
        SnapshotCoordinator,
    },
    credentials::{CredentialCache, StorageMode},
    engine::EngineGateway,
    events::EventBus,
    scheduler::Scheduler,
    store::{DuckDbStore, TaskStore},
};
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cli::Commands;
use crate::commands;
use crate::utils::{ENV_MASTER_PASSWORD, ENV_REPOSITORY_PASSWORD, read_secret};

/// 命令行应用，持有全部协调器
#[derive(Clone)]
pub struct CliApp {
    pub config: AppConfig,
    pub services: CoreServices,
    pub repositories: RepositoryCoordinator,
    pub backups: BackupCoordinator,
    pub snapshots: SnapshotCoordinator,
    pub restores: RestoreCoordinator,
    pub scheduler: Arc<Scheduler>,
}

impl CliApp {
    /// 使用智能配置查找初始化CLI应用
    pub async fn new_with_auto_config() -> Result<Self> {
        let config = AppConfig::find_and_load_config().context("加载配置失败")?;
        Self::from_config(config).await
    }

    /// 从指定配置文件初始化
    pub async fn new_with_config_file(path: &Path) -> Result<Self> {
        let config = AppConfig::load_from_file(path)
            .with_context(|| format!("加载配置文件 {} 失败", path.display()))?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let db_path = config.get_database_path();
        let store = DuckDbStore::open(&db_path)
            .await
            .with_context(|| format!("打开数据库 {} 失败", db_path.display()))?;
        debug!("数据库: {}", db_path.display());
        Self::assemble(config, Arc::new(store)).await
    }

    /// 组装服务句柄和协调器
    pub async fn assemble(config: AppConfig, store: Arc<dyn TaskStore>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::default();
        let engine = EngineGateway::from_config(&config.engine);

        let credentials = Arc::new(CredentialCache::from_config(
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            &config.credentials,
        ));
        credentials
            .restore_preferences()
            .await
            .context("读取密码设置失败")?;

        if credentials.mode() == StorageMode::EncryptedStorage {
            if let Some(master) = env_secret(ENV_MASTER_PASSWORD) {
                credentials.unlock(&master).await.context("主密码解锁失败")?;
                debug!("已通过环境变量解锁加密存储");
            }
        }

        let cache = Arc::new(QueryResultCache::from_config(
            Arc::clone(&clock),
            &config.cache,
        ));
        let services = CoreServices::new(
            store,
            engine,
            credentials,
            cache,
            events,
            clock,
            config.cache.clone(),
        );

        let backups = BackupCoordinator::new(services.clone(), config.runs.slot_scope);
        let scheduler = Arc::new(Scheduler::from_config(backups.clone(), &config.scheduler));

        Ok(Self {
            repositories: RepositoryCoordinator::new(services.clone()),
            snapshots: SnapshotCoordinator::new(services.clone()),
            restores: RestoreCoordinator::new(services.clone()),
            backups,
            scheduler,
            services,
            config,
        })
    }

    /// 运行应用命令
    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Init { .. } => unreachable!(), // 已经在 main.rs 中处理
            Commands::Daemon => commands::run_daemon(self).await,
            Commands::Repo(cmd) => commands::run_repo_command(self, cmd).await,
            Commands::Task(cmd) => commands::run_task_command(self, cmd).await,
            Commands::Snapshot(cmd) => commands::run_snapshot_command(self, cmd).await,
            Commands::Credential(cmd) => commands::run_credential_command(self, cmd).await,
        }
    }

    /// 加密存储模式下确保主密码已解锁
    pub async fn ensure_unlocked(&self) -> Result<()> {
        let credentials = &self.services.credentials;
        if credentials.mode() != StorageMode::EncryptedStorage || credentials.is_unlocked() {
            return Ok(());
        }
        let master = read_secret(ENV_MASTER_PASSWORD, "主密码")?;
        credentials.unlock(&master).await.context("主密码解锁失败")?;
        Ok(())
    }

    /// 确保仓库密码可用
    ///
    /// 依次尝试缓存、加密存储、`BACKUP_REPOSITORY_PASSWORD`，最后从标准输入读取。
    pub async fn ensure_credential(&self, repository_id: i64) -> Result<()> {
        let credentials = &self.services.credentials;
        let cached = match credentials.get(repository_id).await {
            Err(BackupError::MasterKeyRequired) => {
                self.ensure_unlocked().await?;
                credentials.get(repository_id).await?
            }
            other => other?,
        };
        if cached.is_some() {
            return Ok(());
        }

        let secret = read_secret(
            ENV_REPOSITORY_PASSWORD,
            &format!("仓库 {repository_id} 的密码"),
        )?;
        self.ensure_unlocked().await?;
        credentials.set(repository_id, secret).await?;
        if credentials.mode() == StorageMode::Ephemeral {
            info!("密码仅在本次运行中有效");
        }
        Ok(())
    }

    /// 退出前清理
    pub fn shutdown(&self) {
        self.backups.cancel_all();
        self.services.credentials.shutdown();
        if !self.restores.mounted().is_empty() {
            warn!("仍有挂载点未卸载: {:?}", self.restores.mounted());
        }
    }
}

fn env_secret(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}
