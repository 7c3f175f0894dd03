use super::CoreServices;
use crate::cache::CacheKey;
use crate::engine::{EngineCommand, EngineOutput, parse_file_listing, parse_snapshots};
use crate::error::{BackupError, Result};
use crate::events::CoreEvent;
use crate::models::{FileEntry, Snapshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 快照与文件列表查询，读操作优先使用缓存
#[derive(Clone)]
pub struct SnapshotCoordinator {
    services: CoreServices,
}

impl SnapshotCoordinator {
    pub fn new(services: CoreServices) -> Self {
        Self { services }
    }

    async fn query(&self, repository_id: i64, command: EngineCommand) -> Result<EngineOutput> {
        let repository = self.services.repository(repository_id).await?;
        let secret = self.services.resolve_secret(repository_id).await?;
        let result = self
            .services
            .engine
            .execute_checked(&repository, &secret, &command, &CancellationToken::new())
            .await;
        self.services.settle(repository_id, result).await
    }

    /// 快照列表，按时间升序
    pub async fn list_snapshots(
        &self,
        repository_id: i64,
        force_refresh: bool,
    ) -> Result<Vec<Snapshot>> {
        let key = CacheKey::Snapshots(repository_id);
        if !force_refresh {
            if let Some(snapshots) = self
                .services
                .cache
                .get_valid::<Vec<Snapshot>>(&key, self.services.snapshot_ttl())
            {
                debug!(repository_id, "快照列表命中缓存");
                return Ok(snapshots);
            }
        }

        let generation = self.services.cache.generation();
        let output = self
            .query(repository_id, EngineCommand::Snapshots { snapshot_id: None })
            .await?;
        let snapshots = parse_snapshots(&output.stdout)?;
        self.services
            .cache
            .put_if_unchanged(key, snapshots.clone(), generation);
        self.services
            .events
            .publish(CoreEvent::SnapshotsUpdated { repository_id });
        Ok(snapshots)
    }

    /// 按完整 id 或短 id 查找快照
    pub async fn get_snapshot(&self, repository_id: i64, snapshot_id: &str) -> Result<Snapshot> {
        let matches = |snapshot: &Snapshot| {
            snapshot.id == snapshot_id
                || snapshot.short_id.as_deref() == Some(snapshot_id)
                || (snapshot_id.len() >= 8 && snapshot.id.starts_with(snapshot_id))
        };

        if let Some(cached) = self.services.cache.get_valid::<Vec<Snapshot>>(
            &CacheKey::Snapshots(repository_id),
            self.services.snapshot_ttl(),
        ) {
            if let Some(snapshot) = cached.into_iter().find(|s| matches(s)) {
                return Ok(snapshot);
            }
        }

        let output = self
            .query(
                repository_id,
                EngineCommand::Snapshots {
                    snapshot_id: Some(snapshot_id.to_string()),
                },
            )
            .await?;
        parse_snapshots(&output.stdout)?
            .into_iter()
            .find(|s| matches(s))
            .ok_or_else(|| BackupError::not_found(format!("快照 {snapshot_id} 不存在")))
    }

    /// 快照中某个目录下的文件，`path` 为空时列出根目录
    pub async fn list_files(
        &self,
        repository_id: i64,
        snapshot_id: &str,
        path: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<FileEntry>> {
        let path = path.filter(|p| !p.is_empty()).unwrap_or("/");
        let key = CacheKey::files(snapshot_id, path);
        if !force_refresh {
            if let Some(files) = self
                .services
                .cache
                .get_valid::<Vec<FileEntry>>(&key, self.services.file_listing_ttl())
            {
                return Ok(files);
            }
        }

        let generation = self.services.cache.generation();
        let output = self
            .query(
                repository_id,
                EngineCommand::Ls {
                    snapshot_id: snapshot_id.to_string(),
                    path: Some(path.to_string()),
                },
            )
            .await?;
        let files = parse_file_listing(&output.stdout);
        self.services
            .cache
            .put_if_unchanged(key, files.clone(), generation);
        Ok(files)
    }

    /// 删除快照并清理数据
    pub async fn delete_snapshots(&self, repository_id: i64, snapshot_ids: &[String]) -> Result<()> {
        if snapshot_ids.is_empty() {
            return Err(BackupError::invalid_input("没有指定要删除的快照"));
        }

        let result = self
            .query(
                repository_id,
                EngineCommand::Forget {
                    snapshot_ids: snapshot_ids.to_vec(),
                },
            )
            .await;
        self.services.cache.invalidate_repository(repository_id);
        result?;

        for snapshot_id in snapshot_ids {
            self.services.cache.invalidate_snapshot_files(snapshot_id);
            self.services.events.publish(CoreEvent::SnapshotDeleted {
                repository_id,
                snapshot_id: snapshot_id.clone(),
            });
        }
        info!(repository_id, "已删除 {} 个快照", snapshot_ids.len());
        self.services
            .events
            .publish(CoreEvent::SnapshotsUpdated { repository_id });
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coordinator::testing::{add_repository, harness};
    use crate::test_support::{invocation_count, invocations};
    use chrono::Duration;
    use secrecy::SecretString;
    use tempfile::tempdir;

    // 根据子命令输出不同内容
    const ENGINE: &str = r#"case "$1" in
snapshots)
  echo '[{"id":"bbbbbbbb22222222","short_id":"bbbbbbbb","time":"2024-06-02T10:00:00Z","hostname":"h","paths":["/data"]},{"id":"aaaaaaaa11111111","short_id":"aaaaaaaa","time":"2024-06-01T10:00:00Z","hostname":"h","paths":["/data"]}]'
  ;;
ls)
  echo '{"message_type":"snapshot","id":"aaaaaaaa11111111"}'
  echo '{"name":"a.txt","type":"file","path":"/data/a.txt","size":5,"mode":420}'
  echo 'garbage'
  echo '{"name":"sub","type":"dir","path":"/data/sub","mode":2147484141}'
  ;;
esac"#;

    async fn setup(
        dir: &std::path::Path,
    ) -> (crate::coordinator::testing::Harness, SnapshotCoordinator, i64) {
        let h = harness(dir, ENGINE).await;
        let repo = add_repository(&h.services, "r").await;
        h.services
            .credentials
            .set(repo.id, SecretString::from("pw"))
            .await
            .unwrap();
        let snapshots = SnapshotCoordinator::new(h.services.clone());
        (h, snapshots, repo.id)
    }

    #[tokio::test]
    async fn test_snapshot_list_is_cached_within_ttl() {
        let temp_dir = tempdir().unwrap();
        let (h, snapshots, repo_id) = setup(temp_dir.path()).await;

        let list = snapshots.list_snapshots(repo_id, false).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "aaaaaaaa11111111");

        h.clock.advance(Duration::minutes(4));
        snapshots.list_snapshots(repo_id, false).await.unwrap();
        assert_eq!(invocation_count(temp_dir.path()), 1);

        h.clock.advance(Duration::minutes(2));
        snapshots.list_snapshots(repo_id, false).await.unwrap();
        assert_eq!(invocation_count(temp_dir.path()), 2);

        snapshots.list_snapshots(repo_id, true).await.unwrap();
        assert_eq!(invocation_count(temp_dir.path()), 3);
    }

    #[tokio::test]
    async fn test_get_snapshot_by_short_id() {
        let temp_dir = tempdir().unwrap();
        let (_h, snapshots, repo_id) = setup(temp_dir.path()).await;

        snapshots.list_snapshots(repo_id, false).await.unwrap();
        let snapshot = snapshots.get_snapshot(repo_id, "bbbbbbbb").await.unwrap();
        assert_eq!(snapshot.id, "bbbbbbbb22222222");
        assert_eq!(invocation_count(temp_dir.path()), 1);

        assert!(matches!(
            snapshots.get_snapshot(repo_id, "cccccccc").await,
            Err(BackupError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_listing_skips_headers_and_garbage() {
        let temp_dir = tempdir().unwrap();
        let (_h, snapshots, repo_id) = setup(temp_dir.path()).await;

        let files = snapshots
            .list_files(repo_id, "aaaaaaaa11111111", Some("/data"), false)
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[1].is_dir());
        snapshots
            .list_files(repo_id, "aaaaaaaa11111111", Some("/data"), false)
            .await
            .unwrap();
        assert_eq!(invocations(temp_dir.path()), vec!["ls aaaaaaaa11111111 --json /data".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_invalidates_repository_and_files() {
        let temp_dir = tempdir().unwrap();
        let (h, snapshots, repo_id) = setup(temp_dir.path()).await;
        let other = add_repository(&h.services, "other").await;
        h.services.cache.put(CacheKey::Snapshots(other.id), Vec::<Snapshot>::new());

        snapshots.list_snapshots(repo_id, false).await.unwrap();
        snapshots
            .list_files(repo_id, "aaaaaaaa11111111", None, false)
            .await
            .unwrap();
        let mut rx = h.services.events.subscribe();

        snapshots
            .delete_snapshots(repo_id, &["aaaaaaaa11111111".to_string()])
            .await
            .unwrap();

        let cache = &h.services.cache;
        let ttl = Duration::minutes(60);
        assert!(!cache.is_valid(&CacheKey::Snapshots(repo_id), ttl));
        assert!(!cache.is_valid(&CacheKey::files("aaaaaaaa11111111", "/"), ttl));
        assert!(cache.is_valid(&CacheKey::Snapshots(other.id), ttl));
        assert_eq!(
            rx.try_recv().unwrap(),
            CoreEvent::SnapshotDeleted {
                repository_id: repo_id,
                snapshot_id: "aaaaaaaa11111111".to_string()
            }
        );
        assert_eq!(
            invocations(temp_dir.path()).last().map(String::as_str),
            Some("forget aaaaaaaa11111111 --prune")
        );
    }

    #[tokio::test]
    async fn test_query_without_credential() {
        let temp_dir = tempdir().unwrap();
        let h = harness(temp_dir.path(), ENGINE).await;
        let repo = add_repository(&h.services, "r").await;
        let snapshots = SnapshotCoordinator::new(h.services.clone());

        assert!(matches!(
            snapshots.list_snapshots(repo.id, false).await,
            Err(BackupError::CredentialRequired { .. })
        ));
        assert_eq!(invocation_count(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_invalidation_during_query_is_not_overwritten() {
        let temp_dir = tempdir().unwrap();
        let h = harness(
            temp_dir.path(),
            r#"sleep 1
echo '[{"id":"aaaaaaaa11111111","time":"2024-06-01T10:00:00Z","hostname":"h","paths":["/data"]}]'"#,
        )
        .await;
        let repo = add_repository(&h.services, "r").await;
        h.services
            .credentials
            .set(repo.id, SecretString::from("pw"))
            .await
            .unwrap();
        let snapshots = SnapshotCoordinator::new(h.services.clone());

        let pending = {
            let snapshots = snapshots.clone();
            tokio::spawn(async move { snapshots.list_snapshots(repo.id, false).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        // 查询进行中时有新的备份完成
        h.services.cache.invalidate_repository(repo.id);

        assert_eq!(pending.await.unwrap().unwrap().len(), 1);
        assert!(h.services.cache.get::<Vec<Snapshot>>(&CacheKey::Snapshots(repo.id)).is_none());

        snapshots.list_snapshots(repo.id, false).await.unwrap();
        assert_eq!(invocation_count(temp_dir.path()), 2);
        // 这次查询期间没有失效，结果进入缓存
        snapshots.list_snapshots(repo.id, false).await.unwrap();
        assert_eq!(invocation_count(temp_dir.path()), 2);
    }
}
