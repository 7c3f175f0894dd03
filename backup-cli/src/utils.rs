use anyhow::{Context, Result, bail};
use secrecy::SecretString;
use std::io::BufRead;
use tracing_appender::non_blocking::WorkerGuard;

/// 仓库密码环境变量
pub const ENV_REPOSITORY_PASSWORD: &str = "BACKUP_REPOSITORY_PASSWORD";

/// 主密码环境变量，加密存储模式下启动时自动解锁
pub const ENV_MASTER_PASSWORD: &str = "BACKUP_MASTER_PASSWORD";

/// 更换主密码时的新主密码
pub const ENV_NEW_MASTER_PASSWORD: &str = "BACKUP_NEW_MASTER_PASSWORD";

/// 日志文件环境变量
pub const ENV_LOG_FILE: &str = "BACKUP_LOG_FILE";

/// # 日志配置
///
/// 库代码只使用 `tracing` 宏，订阅者在这里统一初始化。
///
/// - `-v, --verbose`：DEBUG 级别
/// - `RUST_LOG`：覆盖默认级别，例如 `RUST_LOG=backup_core::engine=debug`
/// - `BACKUP_LOG_FILE`：设置后日志写入文件（非阻塞），否则输出到终端
///
/// 返回的 guard 需要保持到进程退出，否则缓冲中的日志会丢失。
pub fn setup_logging(verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_file = std::env::var(ENV_LOG_FILE)
        .ok()
        .filter(|path| !path.trim().is_empty());
    let file = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eprintln!("无法打开日志文件 {path}: {e}，改为输出到终端"))
            .ok()
    });

    match file {
        Some(file) => {
            // 文件输出保留模块路径和行号便于排查
            let (writer, guard) = tracing_appender::non_blocking(file);
            fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .with_line_number(true)
                .init();
            Some(guard)
        }
        None => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_names(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .init();
            None
        }
    }
}

/// 从环境变量读取密码，未设置时从标准输入读取一行
pub fn read_secret(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(SecretString::from(value));
        }
    }

    eprint!("{prompt}: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("读取密码失败")?;
    let secret = line.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        bail!("密码不能为空");
    }
    Ok(SecretString::from(secret))
}

/// 字节数转为可读格式
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
