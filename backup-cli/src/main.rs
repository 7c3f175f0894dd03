use backup_cli::{Cli, CliApp, Commands, run_init, setup_logging};
use backup_core::BackupError;
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let cli = Cli::parse();

    // 设置日志记录，guard 需要保持到退出
    let _log_guard = setup_logging(cli.verbose);

    // `init` 命令是特例，它不需要预先加载配置
    if let Commands::Init { force } = cli.command {
        if let Err(e) = run_init(force).await {
            error!("❌ 初始化失败: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let app = match &cli.config {
        Some(path) => CliApp::new_with_config_file(path).await,
        None => CliApp::new_with_auto_config().await,
    };
    let app = match app {
        Ok(app) => app,
        Err(e) => {
            error!("❌ 应用初始化失败: {:#}", e);
            std::process::exit(1);
        }
    };

    // 运行命令
    if let Err(e) = app.run(cli.command).await {
        error!("❌ 操作失败: {:#}", e);
        if let Some(BackupError::CredentialRequired { repository_id }) =
            e.downcast_ref::<BackupError>()
        {
            error!(
                "👉 请先运行 'backup-cli credential set {}' 或设置 BACKUP_REPOSITORY_PASSWORD",
                repository_id
            );
        }
        app.shutdown();
        std::process::exit(1);
    }
    app.shutdown();
}
