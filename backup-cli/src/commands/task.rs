use crate::app::CliApp;
use crate::cli::TaskCommand;
use crate::utils::format_bytes;
use anyhow::{Result, bail};
use backup_core::events::CoreEvent;
use backup_core::models::{BackupTask, RunOutcome};
use chrono::Local;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

pub async fn run_task_command(app: &CliApp, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Add {
            name,
            repo,
            paths,
            excludes,
            tags,
            schedule,
        } => {
            let mut task = BackupTask::new(name, repo, paths, schedule.to_schedule());
            task.exclude_patterns = excludes;
            task.tags = tags;
            let task = app.backups.create_task(task).await?;
            info!("✅ 已添加任务 #{} {}", task.id, task.name);
            if let Some(next_run) = task.next_run {
                info!(
                    "⏰ 下次运行: {}",
                    next_run.with_timezone(&Local).format("%Y-%m-%d %H:%M")
                );
            }
        }
        TaskCommand::List { json } => {
            let tasks = app.backups.list_tasks().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            if tasks.is_empty() {
                info!("📭 还没有任务，使用 'backup-cli task add' 添加");
                return Ok(());
            }
            for task in tasks {
                print_task(&task);
            }
        }
        TaskCommand::Remove { id } => {
            app.backups.delete_task(id).await?;
            info!("🗑️  已删除任务 #{}", id);
        }
        TaskCommand::Enable { id } => {
            let task = app.backups.set_enabled(id, true).await?;
            info!("▶️  已启用任务 #{} {}", task.id, task.name);
        }
        TaskCommand::Disable { id } => {
            let task = app.backups.set_enabled(id, false).await?;
            info!("⏸️  已禁用任务 #{} {}", task.id, task.name);
        }
        TaskCommand::Run { id } => run_now(app, id).await?,
        TaskCommand::History { id, limit } => {
            let history = app.backups.history(id, limit).await?;
            if history.is_empty() {
                info!("📭 任务 #{} 还没有运行记录", id);
            }
            for run in history {
                let local = run.started_at.with_timezone(&Local);
                println!(
                    "{}  {:<9} {:>5}s  {}",
                    local.format("%Y-%m-%d %H:%M:%S"),
                    run.outcome,
                    run.duration().num_seconds(),
                    run.snapshot_id()
                        .map(str::to_string)
                        .or(run.error.clone())
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn print_task(task: &BackupTask) {
    let next_run = task
        .next_run
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>4}  {:<20} 仓库 #{:<4} {:<8} {:<4} 下次: {}  {}",
        task.id,
        task.name,
        task.repository_id,
        task.schedule.recurrence.as_str(),
        if task.enabled { "启用" } else { "禁用" },
        next_run,
        task.source_paths.join(", ")
    );
}

/// 立即运行任务，Ctrl-C 取消
async fn run_now(app: &CliApp, task_id: i64) -> Result<()> {
    let task = app.backups.get_task(task_id).await?;
    app.ensure_credential(task.repository_id).await?;

    let mut events = app.services.events.subscribe();
    let handle = app.backups.run(task_id).await?;
    info!("💾 开始备份: {}", task.name);

    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoreEvent::BackupProgress { task_id: id, progress }) if id == task_id => {
                    info!(
                        "   {:>5.1}%  {} / {}",
                        progress.percent_done * 100.0,
                        format_bytes(progress.bytes_done),
                        format_bytes(progress.total_bytes)
                    );
                }
                Ok(CoreEvent::BackupFinished { task_id: id, .. }) if id == task_id => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("跳过 {} 条进度事件", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel = tokio::spawn({
        let backups = app.backups.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⏹️  收到中断信号，正在取消备份...");
                backups.cancel(task_id);
            }
        }
    });

    let result = handle.wait().await;
    cancel.abort();
    progress.abort();
    let result = result?;

    match result.outcome {
        RunOutcome::Success => {
            info!(
                "✅ 备份完成: 快照 {}，新增数据 {}，耗时 {} 秒",
                result.snapshot_id().unwrap_or("-"),
                format_bytes(result.summary.data_added),
                result.duration().num_seconds()
            );
            Ok(())
        }
        RunOutcome::Cancelled => bail!("备份已取消"),
        RunOutcome::TimedOut => {
            error!("❌ {}", result.error.unwrap_or_default());
            bail!("备份超时")
        }
        RunOutcome::Failed => {
            let message = result.error.unwrap_or_default();
            error!("❌ {}", message);
            bail!("备份失败")
        }
    }
}
