use crate::app::CliApp;
use crate::cli::SnapshotCommand;
use crate::utils::format_bytes;
use anyhow::Result;
use backup_core::events::CoreEvent;
use backup_core::models::RestoreOptions;
use chrono::Local;
use tracing::{info, warn};

pub async fn run_snapshot_command(app: &CliApp, cmd: SnapshotCommand) -> Result<()> {
    match cmd {
        SnapshotCommand::List {
            repo,
            refresh,
            json,
        } => {
            app.ensure_credential(repo).await?;
            let snapshots = app.snapshots.list_snapshots(repo, refresh).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
                return Ok(());
            }
            if snapshots.is_empty() {
                info!("📭 仓库 #{} 中没有快照", repo);
            }
            for snapshot in snapshots {
                println!(
                    "{:<10} {}  {:<16} {}",
                    snapshot.short_id.as_deref().unwrap_or(&snapshot.id),
                    snapshot.time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    snapshot.hostname,
                    snapshot.paths.join(", ")
                );
            }
        }
        SnapshotCommand::Ls {
            repo,
            snapshot,
            path,
        } => {
            app.ensure_credential(repo).await?;
            let files = app
                .snapshots
                .list_files(repo, &snapshot, path.as_deref(), false)
                .await?;
            for file in files {
                let size = if file.is_dir() {
                    "-".to_string()
                } else {
                    format_bytes(file.size)
                };
                println!("{:>4}  {:>10}  {}", file.mode_octal(), size, file.path);
            }
        }
        SnapshotCommand::Forget { repo, snapshots } => {
            app.ensure_credential(repo).await?;
            app.snapshots.delete_snapshots(repo, &snapshots).await?;
            info!("🗑️  已删除 {} 个快照", snapshots.len());
        }
        SnapshotCommand::Restore {
            repo,
            snapshot,
            target,
            includes,
            excludes,
            verify,
        } => {
            app.ensure_credential(repo).await?;
            let options = RestoreOptions {
                target_path: target,
                include_paths: includes,
                exclude_paths: excludes,
                verify,
            };
            restore(app, repo, &snapshot, options).await?;
        }
        SnapshotCommand::Mount {
            repo,
            mount_point,
            snapshot,
        } => {
            app.ensure_credential(repo).await?;
            let handle = app.restores.mount(repo, &mount_point, snapshot).await?;
            info!("📂 已挂载到 {}，按 Ctrl-C 卸载", handle.mount_point());

            let unmount = tokio::spawn({
                let restores = app.restores.clone();
                let point = mount_point.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        restores.unmount(&point);
                    }
                }
            });
            let result = handle.wait().await;
            unmount.abort();
            result?;
        }
    }
    Ok(())
}

async fn restore(
    app: &CliApp,
    repository_id: i64,
    snapshot_id: &str,
    options: RestoreOptions,
) -> Result<()> {
    info!("♻️  恢复快照 {} 到 {}", snapshot_id, options.target_path);
    let mut events = app.services.events.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CoreEvent::RestoreProgress { progress, .. } => info!(
                    "   {:>5.1}%  {}/{} 个文件",
                    progress.percent_done * 100.0,
                    progress.files_done,
                    progress.total_files
                ),
                CoreEvent::RestoreFinished { .. } => break,
                _ => {}
            }
        }
    });

    let cancel = tokio::spawn({
        let restores = app.restores.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⏹️  收到中断信号，正在取消恢复...");
                restores.cancel_restore();
            }
        }
    });

    let result = app.restores.restore(repository_id, snapshot_id, options).await;
    cancel.abort();
    progress.abort();
    result?;
    info!("✅ 恢复完成");
    Ok(())
}
