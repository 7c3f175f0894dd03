use anyhow::{Context, Result};
use backup_core::{config::AppConfig, constants::config, store::DuckDbStore};
use std::path::Path;
use tracing::{info, warn};

/// 运行独立的初始化流程
pub async fn run_init(force: bool) -> Result<()> {
    init_in(Path::new(config::DEFAULT_CONFIG_FILE), force).await
}

/// 在指定位置写入默认配置并创建数据库
pub async fn init_in(config_path: &Path, force: bool) -> Result<()> {
    info!("📦 备份工具初始化");
    info!("==================");

    if !force && config_path.exists() {
        warn!("⚠️  配置文件已存在: {}", config_path.display());
        info!("如果您要重新初始化，请使用 --force 参数");
        info!("示例: backup-cli init --force");
        return Ok(());
    }

    info!("📋 步骤 1: 创建配置文件");
    let mut app_config = AppConfig::default();
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        // 数据库放在配置文件旁边
        app_config.database.path = parent
            .join(config::DEFAULT_DATABASE_PATH)
            .to_string_lossy()
            .into_owned();
    }
    app_config
        .save_to_file(config_path)
        .with_context(|| format!("写入 {} 失败", config_path.display()))?;
    info!("   ✅ 创建配置文件: {}", config_path.display());

    info!("📋 步骤 2: 初始化数据库");
    let db_path = app_config.get_database_path();
    DuckDbStore::open(&db_path)
        .await
        .with_context(|| format!("创建数据库 {} 失败", db_path.display()))?;
    info!("   ✅ 创建DuckDB数据库: {}", db_path.display());

    info!("🎉 初始化完成");
    info!("下一步: backup-cli repo add <名称> <路径> 添加仓库");
    Ok(())
}
