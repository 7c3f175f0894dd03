use super::CoreServices;
use crate::cache::CacheKey;
use crate::engine::{EngineCommand, EngineOutput, parse_stats};
use crate::error::{BackupError, Result};
use crate::events::CoreEvent;
use crate::models::{PrunePolicy, RepoStats, Repository};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 仓库管理与维护
#[derive(Clone)]
pub struct RepositoryCoordinator {
    services: CoreServices,
}

impl RepositoryCoordinator {
    pub fn new(services: CoreServices) -> Self {
        Self { services }
    }

    /// 添加仓库
    ///
    /// `initialize` 为 true 时先在后端执行 init，失败则撤销已保存的记录。
    /// 第一个仓库自动成为默认仓库。
    pub async fn create(
        &self,
        mut repository: Repository,
        secret: Option<SecretString>,
        initialize: bool,
    ) -> Result<Repository> {
        repository.validate()?;
        if initialize && secret.is_none() {
            return Err(BackupError::CredentialRequired { repository_id: 0 });
        }

        let existing = self.services.store.list_repositories().await?;
        repository.created_at = self.services.clock.now();
        repository.last_backup = None;
        repository.is_default = repository.is_default || existing.is_empty();
        repository.id = self.services.store.insert_repository(&repository).await?;

        if let Err(e) = self.finish_create(&repository, secret, initialize).await {
            warn!(repository_id = repository.id, "添加仓库失败，撤销记录: {}", e);
            if let Err(rollback) = self.services.credentials.remove(repository.id).await {
                warn!(repository_id = repository.id, "撤销仓库密码失败: {}", rollback);
            }
            if let Err(rollback) = self.services.store.delete_repository(repository.id).await {
                warn!(repository_id = repository.id, "撤销仓库记录失败: {}", rollback);
            }
            return Err(e);
        }

        info!(repository_id = repository.id, "添加仓库: {}", repository.name);
        self.services.events.publish(CoreEvent::RepositoryCreated {
            repository_id: repository.id,
        });
        Ok(repository)
    }

    async fn finish_create(
        &self,
        repository: &Repository,
        secret: Option<SecretString>,
        initialize: bool,
    ) -> Result<()> {
        if repository.is_default {
            self.services
                .store
                .set_default_repository(repository.id)
                .await?;
        }
        let Some(secret) = secret else {
            return Ok(());
        };
        if initialize {
            self.services
                .engine
                .execute_checked(
                    repository,
                    &secret,
                    &EngineCommand::Init,
                    &CancellationToken::new(),
                )
                .await?;
        }
        self.services.credentials.set(repository.id, secret).await
    }

    pub async fn update(&self, mut repository: Repository) -> Result<Repository> {
        repository.validate()?;
        let existing = self.get(repository.id).await?;
        repository.created_at = existing.created_at;
        repository.last_backup = existing.last_backup;
        self.services.store.update_repository(&repository).await?;
        if repository.is_default && !existing.is_default {
            self.services
                .store
                .set_default_repository(repository.id)
                .await?;
        }

        self.services.cache.invalidate_repository(repository.id);
        self.services.events.publish(CoreEvent::RepositoryUpdated {
            repository_id: repository.id,
        });
        Ok(repository)
    }

    /// 删除仓库记录和已保存的密码，不删除后端数据
    pub async fn delete(&self, repository_id: i64) -> Result<()> {
        let repository = self.get(repository_id).await?;
        let tasks = self
            .services
            .store
            .list_tasks_by_repository(repository_id)
            .await?;
        if !tasks.is_empty() {
            return Err(BackupError::invalid_input(format!(
                "仓库 {} 仍被 {} 个任务使用",
                repository.name,
                tasks.len()
            )));
        }

        self.services.credentials.remove(repository_id).await?;
        self.services.store.delete_repository(repository_id).await?;
        self.services.cache.invalidate_repository(repository_id);

        info!(repository_id, "删除仓库: {}", repository.name);
        self.services
            .events
            .publish(CoreEvent::RepositoryDeleted { repository_id });
        Ok(())
    }

    pub async fn get(&self, repository_id: i64) -> Result<Repository> {
        self.services.repository(repository_id).await
    }

    pub async fn list(&self) -> Result<Vec<Repository>> {
        self.services.store.list_repositories().await
    }

    pub async fn default_repository(&self) -> Result<Option<Repository>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|repository| repository.is_default))
    }

    pub async fn set_default(&self, repository_id: i64) -> Result<()> {
        self.services
            .store
            .set_default_repository(repository_id)
            .await?;
        self.services
            .events
            .publish(CoreEvent::RepositoryUpdated { repository_id });
        Ok(())
    }

    /// 保存仓库密码
    pub async fn set_credential(&self, repository_id: i64, secret: SecretString) -> Result<()> {
        self.get(repository_id).await?;
        self.services.credentials.set(repository_id, secret).await
    }

    /// 用给定密码试读快照列表，不修改任何状态
    pub async fn test_connection(
        &self,
        repository: &Repository,
        secret: &SecretString,
    ) -> Result<()> {
        self.services
            .engine
            .execute_checked(
                repository,
                secret,
                &EngineCommand::Snapshots { snapshot_id: None },
                &CancellationToken::new(),
            )
            .await?;
        Ok(())
    }

    /// 检查仓库完整性，返回引擎输出
    pub async fn check(&self, repository_id: i64, read_data: bool) -> Result<String> {
        let output = self
            .maintain(repository_id, EngineCommand::Check { read_data })
            .await?;
        Ok(output.stdout)
    }

    /// 依次重建索引和修复快照
    pub async fn repair(&self, repository_id: i64) -> Result<()> {
        self.maintain(repository_id, EngineCommand::RepairIndex)
            .await?;
        self.maintain(repository_id, EngineCommand::RepairSnapshots)
            .await?;
        self.services.cache.invalidate_repository(repository_id);
        self.services
            .events
            .publish(CoreEvent::SnapshotsUpdated { repository_id });
        Ok(())
    }

    /// 移除残留的仓库锁
    pub async fn unlock(&self, repository_id: i64) -> Result<()> {
        self.maintain(repository_id, EngineCommand::Unlock).await?;
        Ok(())
    }

    /// 按保留策略清理快照
    pub async fn prune(&self, repository_id: i64, policy: PrunePolicy) -> Result<()> {
        if policy.is_empty() {
            return Err(BackupError::invalid_input("保留策略不能全部为 0"));
        }
        let result = self
            .maintain(repository_id, EngineCommand::Prune(policy))
            .await;
        // 部分清理也可能已经生效
        self.services.cache.invalidate_repository(repository_id);
        result?;
        self.services
            .events
            .publish(CoreEvent::SnapshotsUpdated { repository_id });
        Ok(())
    }

    /// 仓库统计，优先使用缓存
    pub async fn stats(&self, repository_id: i64, force_refresh: bool) -> Result<RepoStats> {
        let key = CacheKey::Stats(repository_id);
        if !force_refresh {
            if let Some(stats) = self
                .services
                .cache
                .get_valid::<RepoStats>(&key, self.services.stats_ttl())
            {
                return Ok(stats);
            }
        }

        let repository = self.get(repository_id).await?;
        let secret = self.services.resolve_secret(repository_id).await?;
        let generation = self.services.cache.generation();
        let result = self
            .services
            .engine
            .execute_checked(
                &repository,
                &secret,
                &EngineCommand::Stats,
                &CancellationToken::new(),
            )
            .await;
        let output = self.services.settle(repository_id, result).await?;
        let stats = parse_stats(&output.stdout)?;
        self.services
            .cache
            .put_if_unchanged(key, stats.clone(), generation);
        Ok(stats)
    }

    async fn maintain(&self, repository_id: i64, command: EngineCommand) -> Result<EngineOutput> {
        let repository = self.get(repository_id).await?;
        let secret = self.services.resolve_secret(repository_id).await?;

        info!(repository_id, "仓库维护: {}", command.name());
        let result = self
            .services
            .engine
            .execute_checked(&repository, &secret, &command, &CancellationToken::new())
            .await;
        let result = self.services.settle(repository_id, result).await;

        self.services.events.publish(CoreEvent::MaintenanceFinished {
            repository_id,
            operation: command.name().to_string(),
            success: result.is_ok(),
            message: result.as_ref().err().map(ToString::to_string),
        });
        result
    }
}
