use super::CoreServices;
use crate::engine::{EngineCommand, EngineEvent, EngineOutput};
use crate::error::{BackupError, Result};
use crate::events::CoreEvent;
use crate::models::RestoreOptions;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct ActiveRestore {
    repository_id: i64,
    snapshot_id: String,
    cancel: CancellationToken,
}

/// 已挂载的快照，引擎进程在后台保持运行
pub struct MountHandle {
    mount_point: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl MountHandle {
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// 请求卸载，引擎先收到 SIGINT，宽限期后仍未退出才会被强制终止
    pub fn unmount(&self) {
        self.cancel.cancel();
    }

    /// 等待挂载进程退出，主动卸载视为正常结束
    pub async fn wait(self) -> Result<()> {
        match self.join.await? {
            Ok(()) | Err(BackupError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// 恢复与挂载
#[derive(Clone)]
pub struct RestoreCoordinator {
    services: CoreServices,
    active: Arc<Mutex<Option<ActiveRestore>>>,
    mounts: Arc<DashMap<String, CancellationToken>>,
}

impl RestoreCoordinator {
    pub fn new(services: CoreServices) -> Self {
        Self {
            services,
            active: Arc::new(Mutex::new(None)),
            mounts: Arc::new(DashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRestore>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_restoring(&self) -> bool {
        self.active().is_some()
    }

    /// 取消正在进行的恢复
    pub fn cancel_restore(&self) -> bool {
        match self.active().as_ref() {
            Some(restore) => {
                info!(
                    repository_id = restore.repository_id,
                    snapshot_id = %restore.snapshot_id,
                    "请求取消恢复"
                );
                restore.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 将快照恢复到目标目录，同一时间只允许一个恢复
    pub async fn restore(
        &self,
        repository_id: i64,
        snapshot_id: &str,
        options: RestoreOptions,
    ) -> Result<()> {
        if options.target_path.trim().is_empty() {
            return Err(BackupError::invalid_input("恢复目标路径不能为空"));
        }
        let repository = self.services.repository(repository_id).await?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active();
            if let Some(current) = active.as_ref() {
                return Err(BackupError::already_running(format!(
                    "正在恢复快照 {}",
                    current.snapshot_id
                )));
            }
            *active = Some(ActiveRestore {
                repository_id,
                snapshot_id: snapshot_id.to_string(),
                cancel: cancel.clone(),
            });
        }
        let _guard = RestoreGuard(&self.active);

        let secret = self.services.resolve_secret(repository_id).await?;
        info!(
            repository_id,
            snapshot_id,
            target = %options.target_path,
            "开始恢复"
        );
        self.services.events.publish(CoreEvent::RestoreStarted {
            repository_id,
            snapshot_id: snapshot_id.to_string(),
        });

        let command = EngineCommand::Restore {
            snapshot_id: snapshot_id.to_string(),
            options,
        };
        let events = self.services.events.clone();
        let result = self
            .services
            .engine
            .execute_streaming(&repository, &secret, &command, &cancel, |event| {
                if let EngineEvent::Status(progress) = event {
                    events.publish(CoreEvent::RestoreProgress {
                        repository_id,
                        progress,
                    });
                }
            })
            .await
            .and_then(EngineOutput::into_result);

        self.services.events.publish(CoreEvent::RestoreFinished {
            repository_id,
            snapshot_id: snapshot_id.to_string(),
            success: result.is_ok(),
            message: result.as_ref().err().map(ToString::to_string),
        });
        self.services.settle(repository_id, result).await?;
        Ok(())
    }

    /// 挂载仓库或单个快照，进程保持运行直到卸载
    pub async fn mount(
        &self,
        repository_id: i64,
        mount_point: &str,
        snapshot_id: Option<String>,
    ) -> Result<MountHandle> {
        if mount_point.trim().is_empty() {
            return Err(BackupError::invalid_input("挂载点不能为空"));
        }
        let repository = self.services.repository(repository_id).await?;
        let secret = self.services.resolve_secret(repository_id).await?;

        let cancel = CancellationToken::new();
        match self.mounts.entry(mount_point.to_string()) {
            Entry::Occupied(_) => {
                return Err(BackupError::already_running(format!(
                    "{mount_point} 已挂载"
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(cancel.clone());
            }
        }
        info!(repository_id, mount_point, "挂载仓库");

        let command = EngineCommand::Mount {
            mount_point: mount_point.to_string(),
            snapshot_id,
        };
        let services = self.services.clone();
        let mounts = Arc::clone(&self.mounts);
        let point = mount_point.to_string();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let result = services
                .engine
                .execute(&repository, &secret, &command, &token)
                .await
                .and_then(EngineOutput::into_result)
                .map(|_| ());
            mounts.remove(&point);
            match &result {
                Ok(()) | Err(BackupError::Cancelled) => info!(mount_point = %point, "已卸载"),
                Err(e) => warn!(mount_point = %point, "挂载进程退出: {}", e),
            }
            services.settle(repository.id, result).await
        });

        Ok(MountHandle {
            mount_point: mount_point.to_string(),
            cancel,
            join,
        })
    }

    /// 卸载，未挂载时返回 false；调用 [`MountHandle::wait`] 等待引擎退出
    pub fn unmount(&self, mount_point: &str) -> bool {
        match self.mounts.get(mount_point) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn mounted(&self) -> Vec<String> {
        self.mounts.iter().map(|entry| entry.key().clone()).collect()
    }
}

struct RestoreGuard<'a>(&'a Mutex<Option<ActiveRestore>>);

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coordinator::testing::{add_repository, harness};
    use crate::test_support::invocations;
    use secrecy::SecretString;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn setup(
        dir: &std::path::Path,
        body: &str,
    ) -> (crate::coordinator::testing::Harness, RestoreCoordinator, i64) {
        let h = harness(dir, body).await;
        let repo = add_repository(&h.services, "r").await;
        h.services
            .credentials
            .set(repo.id, SecretString::from("pw"))
            .await
            .unwrap();
        let restore = RestoreCoordinator::new(h.services.clone());
        (h, restore, repo.id)
    }

    #[tokio::test]
    async fn test_restore_reports_progress() {
        let temp_dir = tempdir().unwrap();
        let (h, restore, repo_id) = setup(
            temp_dir.path(),
            r#"echo '{"message_type":"status","percent_done":0.5,"files_restored":1}'
echo '{"message_type":"summary","files_restored":2}'"#,
        )
        .await;
        let mut rx = h.services.events.subscribe();

        let mut options = RestoreOptions::to("/tmp/restore-target");
        options.include_paths = vec!["/data/a.txt".into()];
        restore.restore(repo_id, "abc123", options).await.unwrap();
        assert!(!restore.is_restoring());

        assert!(matches!(rx.try_recv().unwrap(), CoreEvent::RestoreStarted { .. }));
        assert!(matches!(rx.try_recv().unwrap(), CoreEvent::RestoreProgress { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::RestoreFinished { success: true, .. }
        ));
        assert_eq!(
            invocations(temp_dir.path()),
            vec!["restore abc123 --json --target /tmp/restore-target --include /data/a.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_single_restore_and_cancel() {
        let temp_dir = tempdir().unwrap();
        let (_h, restore, repo_id) = setup(temp_dir.path(), "exec sleep 30").await;

        let first = {
            let restore = restore.clone();
            tokio::spawn(async move { restore.restore(repo_id, "abc", RestoreOptions::to("/tmp/a")).await })
        };
        for _ in 0..100 {
            if restore.is_restoring() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            restore.restore(repo_id, "def", RestoreOptions::to("/tmp/b")).await,
            Err(BackupError::AlreadyRunning(_))
        ));

        assert!(restore.cancel_restore());
        assert!(matches!(first.await.unwrap(), Err(BackupError::Cancelled)));
        assert!(!restore.is_restoring());
        assert!(!restore.cancel_restore());
    }

    #[tokio::test]
    async fn test_restore_requires_target() {
        let temp_dir = tempdir().unwrap();
        let (_h, restore, repo_id) = setup(temp_dir.path(), "true").await;
        assert!(matches!(
            restore.restore(repo_id, "abc", RestoreOptions::default()).await,
            Err(BackupError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_until_unmount() {
        let temp_dir = tempdir().unwrap();
        let (_h, restore, repo_id) = setup(temp_dir.path(), "exec sleep 30").await;

        let handle = restore.mount(repo_id, "/mnt/backup", None).await.unwrap();
        assert_eq!(restore.mounted(), vec!["/mnt/backup".to_string()]);
        assert!(matches!(
            restore.mount(repo_id, "/mnt/backup", None).await,
            Err(BackupError::AlreadyRunning(_))
        ));

        assert!(restore.unmount("/mnt/backup"));
        tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(restore.mounted().is_empty());
        assert!(!restore.unmount("/mnt/backup"));
    }

    #[tokio::test]
    async fn test_unmount_lets_engine_exit_cleanly() {
        let temp_dir = tempdir().unwrap();
        let (_h, restore, repo_id) = setup(
            temp_dir.path(),
            r#"trap 'echo INT > "$(dirname "$0")/signal"; exit 0' INT
echo serving
while :; do sleep 0.1; done"#,
        )
        .await;

        let handle = restore.mount(repo_id, "/mnt/clean", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.unmount();
        tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap()
            .unwrap();

        let marker = std::fs::read_to_string(temp_dir.path().join("signal")).unwrap();
        assert_eq!(marker.trim(), "INT");
        assert!(restore.mounted().is_empty());
    }
}
