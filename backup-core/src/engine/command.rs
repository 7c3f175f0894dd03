use crate::models::{EngineOptions, PrunePolicy, RestoreOptions};

/// 备份引擎子命令
///
/// 只负责命令行参数；仓库地址和密码通过环境变量传入，见 [`super::EngineGateway`]。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Init,
    Check {
        read_data: bool,
    },
    RepairIndex,
    RepairSnapshots,
    Unlock,
    Stats,
    /// forget --prune 按保留策略清理
    Prune(PrunePolicy),
    Backup {
        paths: Vec<String>,
        excludes: Vec<String>,
        tags: Vec<String>,
        options: EngineOptions,
    },
    Snapshots {
        snapshot_id: Option<String>,
    },
    Ls {
        snapshot_id: String,
        path: Option<String>,
    },
    /// 删除指定快照
    Forget {
        snapshot_ids: Vec<String>,
    },
    Restore {
        snapshot_id: String,
        options: RestoreOptions,
    },
    Mount {
        mount_point: String,
        snapshot_id: Option<String>,
    },
    Version,
}

impl EngineCommand {
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::Init => "init",
            EngineCommand::Check { .. } => "check",
            EngineCommand::RepairIndex => "repair index",
            EngineCommand::RepairSnapshots => "repair snapshots",
            EngineCommand::Unlock => "unlock",
            EngineCommand::Stats => "stats",
            EngineCommand::Prune(_) => "forget --prune",
            EngineCommand::Backup { .. } => "backup",
            EngineCommand::Snapshots { .. } => "snapshots",
            EngineCommand::Ls { .. } => "ls",
            EngineCommand::Forget { .. } => "forget",
            EngineCommand::Restore { .. } => "restore",
            EngineCommand::Mount { .. } => "mount",
            EngineCommand::Version => "version",
        }
    }

    /// 是否会在 stdout 输出 status/summary 进度行
    pub fn streams_progress(&self) -> bool {
        matches!(
            self,
            EngineCommand::Backup { .. } | EngineCommand::Restore { .. }
        )
    }

    /// 长时间驻留的命令不受默认超时限制
    pub fn is_long_running(&self) -> bool {
        matches!(self, EngineCommand::Mount { .. })
    }

    /// 取消时先发送 SIGINT，让引擎自行卸载
    pub fn stops_gracefully(&self) -> bool {
        matches!(self, EngineCommand::Mount { .. })
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            EngineCommand::Init => args.push("init".into()),
            EngineCommand::Check { read_data } => {
                args.push("check".into());
                if *read_data {
                    args.push("--read-data".into());
                }
            }
            EngineCommand::RepairIndex => {
                args.extend(["repair", "index"].map(String::from));
            }
            EngineCommand::RepairSnapshots => {
                args.extend(["repair", "snapshots"].map(String::from));
            }
            EngineCommand::Unlock => args.push("unlock".into()),
            EngineCommand::Stats => {
                args.extend(["stats", "--json"].map(String::from));
            }
            EngineCommand::Prune(policy) => {
                args.extend(["forget", "--prune"].map(String::from));
                let keeps = [
                    ("--keep-last", policy.keep_last),
                    ("--keep-daily", policy.keep_daily),
                    ("--keep-weekly", policy.keep_weekly),
                    ("--keep-monthly", policy.keep_monthly),
                    ("--keep-yearly", policy.keep_yearly),
                ];
                for (flag, n) in keeps {
                    if n > 0 {
                        args.push(flag.into());
                        args.push(n.to_string());
                    }
                }
            }
            EngineCommand::Backup {
                paths,
                excludes,
                tags,
                options,
            } => {
                args.extend(["backup", "--json"].map(String::from));
                args.extend(paths.iter().filter(|p| !p.trim().is_empty()).cloned());
                for pattern in excludes {
                    args.push("--exclude".into());
                    args.push(pattern.clone());
                }
                for tag in tags {
                    args.push("--tag".into());
                    args.push(tag.clone());
                }
                args.extend(options.to_args());
            }
            EngineCommand::Snapshots { snapshot_id } => {
                args.extend(["snapshots", "--json"].map(String::from));
                if let Some(id) = snapshot_id {
                    args.push(id.clone());
                }
            }
            EngineCommand::Ls { snapshot_id, path } => {
                args.extend(["ls", snapshot_id.as_str(), "--json"].map(String::from));
                if let Some(path) = path.as_ref().filter(|p| !p.is_empty()) {
                    args.push(path.clone());
                }
            }
            EngineCommand::Forget { snapshot_ids } => {
                args.push("forget".into());
                args.extend(snapshot_ids.iter().cloned());
                args.push("--prune".into());
            }
            EngineCommand::Restore {
                snapshot_id,
                options,
            } => {
                args.extend(
                    [
                        "restore",
                        snapshot_id.as_str(),
                        "--json",
                        "--target",
                        options.target_path.as_str(),
                    ]
                    .map(String::from),
                );
                for path in &options.include_paths {
                    args.push("--include".into());
                    args.push(path.clone());
                }
                for path in &options.exclude_paths {
                    args.push("--exclude".into());
                    args.push(path.clone());
                }
                if options.verify {
                    args.push("--verify".into());
                }
            }
            EngineCommand::Mount {
                mount_point,
                snapshot_id,
            } => {
                args.extend(["mount", mount_point.as_str()].map(String::from));
                if let Some(id) = snapshot_id {
                    args.push(id.clone());
                }
            }
            EngineCommand::Version => args.push("version".into()),
        }
        args
    }
}
