use crate::app::CliApp;
use anyhow::{Context, Result};
use backup_core::events::CoreEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 前台运行调度器，直到收到 Ctrl-C
pub async fn run_daemon(app: &CliApp) -> Result<()> {
    info!("🕒 启动备份调度器");
    let binary = app
        .services
        .engine
        .resolve_binary()
        .context("找不到备份引擎")?;
    info!("   引擎: {}", binary.display());

    let scheduled = app.scheduler.initialize().await?;
    debug!("补齐了 {} 个任务的下次运行时间", scheduled);

    let shutdown = CancellationToken::new();
    let sweeper = app
        .services
        .credentials
        .spawn_sweeper(app.config.sweep_interval(), shutdown.clone());
    let reporter = spawn_event_logger(app, shutdown.clone());
    app.scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("无法监听中断信号")?;
    info!("⏹️  收到中断信号，正在停止...");

    app.scheduler.stop().await;
    let running = app.backups.running_tasks();
    if !running.is_empty() {
        warn!("取消正在运行的任务: {:?}", running);
    }
    app.shutdown();
    shutdown.cancel();
    let _ = tokio::join!(sweeper, reporter);
    info!("👋 调度器已退出");
    Ok(())
}

/// 把核心事件写入日志
fn spawn_event_logger(app: &CliApp, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut events = app.services.events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("事件处理落后，跳过 {} 条", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::TaskTriggered { task_id } => info!("⏰ 触发任务 #{}", task_id),
        CoreEvent::TaskTriggerFailed { task_id, message } => {
            error!("❌ 任务 #{} 触发失败: {}", task_id, message)
        }
        CoreEvent::PersistenceFailed { task_id, message } => {
            error!("💾 任务 #{} 的状态没有保存: {}", task_id, message)
        }
        CoreEvent::BackupFinished {
            task_id,
            outcome,
            snapshot_id,
            message,
            ..
        } => match message {
            Some(message) => warn!("任务 #{} 结束 ({}): {}", task_id, outcome, message),
            None => info!(
                "✅ 任务 #{} 完成，快照 {}",
                task_id,
                snapshot_id.as_deref().unwrap_or("-")
            ),
        },
        CoreEvent::CredentialRequired { repository_id } => warn!(
            "🔑 仓库 #{} 缺少密码，使用 'backup-cli credential set {}' 保存",
            repository_id, repository_id
        ),
        CoreEvent::CredentialRejected { repository_id, .. } => {
            warn!("🔑 仓库 #{} 的密码被拒绝，已清除", repository_id)
        }
        CoreEvent::CredentialExpired { repository_id } => {
            debug!("仓库 #{} 的缓存密码已过期", repository_id)
        }
        other => debug!("{:?}", other),
    }
}
