use crate::app::CliApp;
use crate::cli::RepoCommand;
use crate::utils::{ENV_REPOSITORY_PASSWORD, format_bytes, read_secret};
use anyhow::{Context, Result};
use backup_core::models::{PrunePolicy, Repository};
use tracing::info;

pub async fn run_repo_command(app: &CliApp, cmd: RepoCommand) -> Result<()> {
    match cmd {
        RepoCommand::Add {
            name,
            backend,
            path,
            options,
            init,
            default,
        } => {
            let mut repository = Repository::new(name, backend, path);
            repository.config.extend(options);
            repository.is_default = default;

            let secret = read_secret(ENV_REPOSITORY_PASSWORD, "仓库密码")?;
            app.ensure_unlocked().await?;
            if !init {
                info!("🔍 验证仓库连接...");
                app.repositories
                    .test_connection(&repository, &secret)
                    .await
                    .context("无法访问仓库")?;
            }

            let repository = app
                .repositories
                .create(repository, Some(secret), init)
                .await?;
            info!(
                "✅ 已添加仓库 #{} {} ({})",
                repository.id,
                repository.name,
                repository.connection_string()
            );
        }
        RepoCommand::List { json } => {
            let repositories = app.repositories.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&repositories)?);
                return Ok(());
            }
            if repositories.is_empty() {
                info!("📭 还没有仓库，使用 'backup-cli repo add' 添加");
                return Ok(());
            }
            for repo in repositories {
                let last_backup = repo
                    .last_backup
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}{:>4}  {:<20} {:<8} {:<40} 最近备份: {}",
                    if repo.is_default { "*" } else { " " },
                    repo.id,
                    repo.name,
                    repo.backend,
                    repo.connection_string(),
                    last_backup
                );
            }
        }
        RepoCommand::Remove { id } => {
            app.repositories.delete(id).await?;
            info!("🗑️  已删除仓库 #{}", id);
        }
        RepoCommand::Default { id } => {
            app.repositories.set_default(id).await?;
            info!("✅ 仓库 #{} 已设为默认", id);
        }
        RepoCommand::Check { id, read_data } => {
            app.ensure_credential(id).await?;
            info!("🔍 检查仓库 #{}...", id);
            let output = app.repositories.check(id, read_data).await?;
            println!("{}", output.trim_end());
            info!("✅ 检查完成");
        }
        RepoCommand::Repair { id } => {
            app.ensure_credential(id).await?;
            info!("🔧 修复仓库 #{}...", id);
            app.repositories.repair(id).await?;
            info!("✅ 修复完成");
        }
        RepoCommand::Unlock { id } => {
            app.ensure_credential(id).await?;
            app.repositories.unlock(id).await?;
            info!("🔓 已移除仓库 #{} 的残留锁", id);
        }
        RepoCommand::Stats { id, refresh } => {
            app.ensure_credential(id).await?;
            let stats = app.repositories.stats(id, refresh).await?;
            println!("快照数量: {}", stats.snapshots_count);
            println!("文件数量: {}", stats.total_file_count);
            println!("总大小:   {}", format_bytes(stats.total_size));
        }
        RepoCommand::Prune { id, policy } => {
            let policy = PrunePolicy {
                keep_last: policy.keep_last,
                keep_daily: policy.keep_daily,
                keep_weekly: policy.keep_weekly,
                keep_monthly: policy.keep_monthly,
                keep_yearly: policy.keep_yearly,
            };
            app.ensure_credential(id).await?;
            info!("🧹 按保留策略清理仓库 #{}...", id);
            app.repositories.prune(id, policy).await?;
            info!("✅ 清理完成");
        }
    }
    Ok(())
}
