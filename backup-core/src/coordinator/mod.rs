//! 协调器
//!
//! 各协调器共享同一组服务句柄 [`CoreServices`]，在进程启动时构造一次后按需克隆。

mod backup;
mod repository;
mod restore;
mod run_slot;
mod snapshot;

pub use backup::{BackupCoordinator, RunHandle};
pub use repository::RepositoryCoordinator;
pub use restore::{MountHandle, RestoreCoordinator};
pub use run_slot::{RunSlots, SlotGuard, SlotScope};
pub use snapshot::SnapshotCoordinator;

use crate::cache::QueryResultCache;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::credentials::CredentialCache;
use crate::engine::EngineGateway;
use crate::error::{BackupError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::models::Repository;
use crate::store::TaskStore;
use chrono::Duration;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::warn;

/// 协调器依赖的服务句柄
#[derive(Clone)]
pub struct CoreServices {
    pub store: Arc<dyn TaskStore>,
    pub engine: EngineGateway,
    pub credentials: Arc<CredentialCache>,
    pub cache: Arc<QueryResultCache>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub ttl: CacheConfig,
}

impl CoreServices {
    pub fn new(
        store: Arc<dyn TaskStore>,
        engine: EngineGateway,
        credentials: Arc<CredentialCache>,
        cache: Arc<QueryResultCache>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        ttl: CacheConfig,
    ) -> Self {
        Self {
            store,
            engine,
            credentials,
            cache,
            events,
            clock,
            ttl,
        }
    }

    pub(crate) fn snapshot_ttl(&self) -> Duration {
        Duration::minutes(self.ttl.snapshot_ttl_minutes as i64)
    }

    pub(crate) fn stats_ttl(&self) -> Duration {
        Duration::minutes(self.ttl.stats_ttl_minutes as i64)
    }

    pub(crate) fn file_listing_ttl(&self) -> Duration {
        Duration::minutes(self.ttl.file_listing_ttl_minutes as i64)
    }

    pub(crate) async fn repository(&self, repository_id: i64) -> Result<Repository> {
        self.store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("仓库 {repository_id} 不存在")))
    }

    /// 取出仓库密码，缺失时发布 CredentialRequired
    pub(crate) async fn resolve_secret(&self, repository_id: i64) -> Result<SecretString> {
        match self.credentials.get(repository_id).await? {
            Some(secret) => Ok(secret),
            None => {
                self.events
                    .publish(CoreEvent::CredentialRequired { repository_id });
                Err(BackupError::CredentialRequired { repository_id })
            }
        }
    }

    /// 密码被引擎拒绝：清除缓存并通知
    pub(crate) async fn reject_credential(&self, repository_id: i64, message: String) {
        warn!(repository_id, "仓库密码被拒绝: {}", message);
        if let Err(e) = self.credentials.remove(repository_id).await {
            warn!(repository_id, "清除仓库密码失败: {}", e);
        }
        self.events.publish(CoreEvent::CredentialRejected {
            repository_id,
            message,
        });
    }

    /// 统一处理引擎调用结果中的密码错误
    pub(crate) async fn settle<T>(&self, repository_id: i64, result: Result<T>) -> Result<T> {
        let rejected = match &result {
            Err(BackupError::CredentialRejected { message, .. }) => Some(message.clone()),
            _ => None,
        };
        if let Some(message) = rejected {
            self.reject_credential(repository_id, message).await;
        }
        result
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::StorageMode;
    use crate::models::BackendType;
    use crate::store::DuckDbStore;
    use crate::test_support::{FailingStore, fake_engine};
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    pub struct Harness {
        pub services: CoreServices,
        pub store: Arc<DuckDbStore>,
        /// 服务实际使用的存储，可以注入写入失败
        pub faults: Arc<FailingStore>,
        pub clock: Arc<ManualClock>,
    }

    /// 使用假引擎和内存数据库构造服务
    pub async fn harness(dir: &Path, engine_body: &str) -> Harness {
        let engine = fake_engine(dir, engine_body);
        let store = Arc::new(DuckDbStore::new_memory().await.unwrap());
        let faults = Arc::new(FailingStore::new(store.clone()));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
        ));
        let events = EventBus::new(256);
        let credentials = Arc::new(CredentialCache::new(
            faults.clone(),
            clock.clone(),
            events.clone(),
            StorageMode::SessionCache,
            30,
            1000,
        ));
        let cache = Arc::new(QueryResultCache::new(clock.clone(), 10, 60));
        let services = CoreServices::new(
            faults.clone(),
            EngineGateway::new(engine.to_string_lossy(), std::time::Duration::from_secs(20)),
            credentials,
            cache,
            events,
            clock.clone(),
            CacheConfig::default(),
        );
        Harness {
            services,
            store,
            faults,
            clock,
        }
    }

    pub async fn add_repository(services: &CoreServices, name: &str) -> Repository {
        let mut repository = Repository::new(name, BackendType::Local, format!("/srv/{name}"));
        repository.id = services.store.insert_repository(&repository).await.unwrap();
        repository
    }
}
