use backup_core::credentials::StorageMode;
use backup_core::models::{BackendType, Schedule};
use chrono::{NaiveTime, Weekday};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// 备份任务调度与管理工具
#[derive(Parser)]
#[command(name = "backup-cli")]
#[command(version, about)]
pub struct Cli {
    /// 配置文件路径，未指定时依次查找 backup.toml、.backup.toml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 详细输出
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 创建配置文件和数据库
    Init {
        /// 如果配置文件已存在，强制覆盖
        #[arg(long)]
        force: bool,
    },
    /// 前台运行调度器，直到收到 Ctrl-C
    Daemon,
    /// 仓库管理
    #[command(subcommand)]
    Repo(RepoCommand),
    /// 备份任务管理
    #[command(subcommand)]
    Task(TaskCommand),
    /// 快照查询、恢复与挂载
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// 仓库密码管理
    #[command(subcommand)]
    Credential(CredentialCommand),
}

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// 添加仓库，密码从 BACKUP_REPOSITORY_PASSWORD 或标准输入读取
    Add {
        name: String,
        /// 后端类型
        #[arg(long, value_parser = parse_backend, default_value = "local")]
        backend: BackendType,
        /// 仓库路径或地址
        path: String,
        /// 后端参数，例如 --option host=example.com
        #[arg(long = "option", value_parser = parse_key_value)]
        options: Vec<(String, String)>,
        /// 在后端执行 init 创建新仓库
        #[arg(long)]
        init: bool,
        /// 设为默认仓库
        #[arg(long)]
        default: bool,
    },
    /// 列出仓库
    List {
        #[arg(long)]
        json: bool,
    },
    /// 删除仓库记录（不删除后端数据）
    Remove { id: i64 },
    /// 设为默认仓库
    Default { id: i64 },
    /// 检查仓库完整性
    Check {
        id: i64,
        /// 读取并校验全部数据
        #[arg(long)]
        read_data: bool,
    },
    /// 修复索引和快照
    Repair { id: i64 },
    /// 移除残留锁
    Unlock { id: i64 },
    /// 仓库统计
    Stats {
        id: i64,
        /// 忽略缓存
        #[arg(long)]
        refresh: bool,
    },
    /// 按保留策略清理快照
    Prune {
        id: i64,
        #[command(flatten)]
        policy: PruneArgs,
    },
}

#[derive(Args, Debug, Default)]
pub struct PruneArgs {
    #[arg(long, default_value_t = 0)]
    pub keep_last: u32,
    #[arg(long, default_value_t = 0)]
    pub keep_daily: u32,
    #[arg(long, default_value_t = 0)]
    pub keep_weekly: u32,
    #[arg(long, default_value_t = 0)]
    pub keep_monthly: u32,
    #[arg(long, default_value_t = 0)]
    pub keep_yearly: u32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RecurrenceArg {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// 调度方式
    #[arg(long, value_enum, default_value = "manual")]
    pub schedule: RecurrenceArg,
    /// 运行时间 HH:MM
    #[arg(long, value_parser = parse_time, default_value = "02:00")]
    pub at: NaiveTime,
    /// 每周调度的星期，例如 mon、wed
    #[arg(long, value_parser = parse_weekday, default_value = "mon")]
    pub weekday: Weekday,
}

impl ScheduleArgs {
    pub fn to_schedule(&self) -> Schedule {
        match self.schedule {
            RecurrenceArg::Manual => Schedule::manual(),
            RecurrenceArg::Hourly => Schedule::hourly(),
            RecurrenceArg::Daily => Schedule::daily(self.at),
            RecurrenceArg::Weekly => Schedule::weekly(self.weekday, self.at),
            RecurrenceArg::Monthly => Schedule::monthly(self.at),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// 添加备份任务
    Add {
        name: String,
        /// 仓库 ID
        #[arg(long)]
        repo: i64,
        /// 备份路径
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// 列出任务
    List {
        #[arg(long)]
        json: bool,
    },
    /// 删除任务
    Remove { id: i64 },
    /// 启用任务
    Enable { id: i64 },
    /// 禁用任务
    Disable { id: i64 },
    /// 立即运行任务并等待结束
    Run { id: i64 },
    /// 运行记录
    History {
        id: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// 列出快照
    List {
        repo: i64,
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// 列出快照中的文件
    Ls {
        repo: i64,
        snapshot: String,
        path: Option<String>,
    },
    /// 删除快照
    Forget {
        repo: i64,
        #[arg(required = true)]
        snapshots: Vec<String>,
    },
    /// 恢复快照
    Restore {
        repo: i64,
        snapshot: String,
        #[arg(long)]
        target: String,
        #[arg(long = "include")]
        includes: Vec<String>,
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        #[arg(long)]
        verify: bool,
    },
    /// 挂载仓库，Ctrl-C 卸载
    Mount {
        repo: i64,
        mount_point: String,
        #[arg(long)]
        snapshot: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommand {
    /// 保存仓库密码
    Set { repo: i64 },
    /// 删除仓库密码
    Remove { repo: i64 },
    /// 切换保存方式
    Mode {
        #[arg(value_parser = parse_storage_mode)]
        mode: StorageMode,
    },
    /// 设置过期时间（分钟），0 表示永不过期
    Timeout { minutes: u64 },
    /// 设置或验证主密码
    Unlock,
    /// 更换主密码，已保存的仓库密码会重新加密
    Passwd,
}

fn parse_backend(s: &str) -> Result<BackendType, String> {
    s.parse::<BackendType>().map_err(|e| e.to_string())
}

fn parse_storage_mode(s: &str) -> Result<StorageMode, String> {
    s.parse::<StorageMode>().map_err(|e| e.to_string())
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("时间格式应为 HH:MM: {e}"))
}

fn parse_weekday(s: &str) -> Result<Weekday, String> {
    s.parse::<Weekday>()
        .map_err(|_| format!("无法识别的星期: {s}"))
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("参数格式应为 key=value: {s}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_core::models::Recurrence;

    #[test]
    fn test_parse_task_add() {
        let cli = Cli::try_parse_from([
            "backup-cli",
            "task",
            "add",
            "文档",
            "--repo",
            "1",
            "/home/docs",
            "/etc",
            "--exclude",
            "*.tmp",
            "--schedule",
            "weekly",
            "--weekday",
            "wed",
            "--at",
            "03:30",
        ])
        .unwrap();

        match cli.command {
            Commands::Task(TaskCommand::Add {
                paths,
                excludes,
                schedule,
                ..
            }) => {
                assert_eq!(paths, vec!["/home/docs", "/etc"]);
                assert_eq!(excludes, vec!["*.tmp"]);
                let schedule = schedule.to_schedule();
                assert_eq!(schedule.recurrence, Recurrence::Weekly);
                assert_eq!(schedule.weekday, Weekday::Wed);
                assert_eq!(schedule.time, NaiveTime::from_hms_opt(3, 30, 0).unwrap());
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_parse_repo_add_options() {
        let cli = Cli::try_parse_from([
            "backup-cli",
            "-v",
            "repo",
            "add",
            "远程",
            "--backend",
            "sftp",
            "/backups",
            "--option",
            "host=nas.local",
            "--option",
            "user=backup",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Repo(RepoCommand::Add {
                backend, options, ..
            }) => {
                assert_eq!(backend, BackendType::Sftp);
                assert_eq!(options[0], ("host".to_string(), "nas.local".to_string()));
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_parse_credential_passwd() {
        let cli = Cli::try_parse_from(["backup-cli", "credential", "passwd"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Credential(CredentialCommand::Passwd)
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Cli::try_parse_from(["backup-cli", "credential", "mode", "plain"]).is_err());
        assert!(
            Cli::try_parse_from([
                "backup-cli", "task", "add", "t", "--repo", "1", "/a", "--at", "25:00"
            ])
            .is_err()
        );
        assert!(Cli::try_parse_from(["backup-cli", "repo", "add", "r", "/p", "--option", "novalue"]).is_err());
    }
}
