use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 引擎中的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl FileKind {
    pub fn from_engine(kind: &str) -> Self {
        match kind {
            "file" => FileKind::File,
            "dir" => FileKind::Dir,
            "symlink" => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// 快照中的文件条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: Option<DateTime<Utc>>,
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
}

impl FileEntry {
    /// 八进制权限，例如 "755"
    pub fn mode_octal(&self) -> String {
        format!("{:o}", self.mode & 0o7777)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

/// 仓库统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    pub total_size: u64,
    pub total_file_count: u64,
    pub snapshots_count: u64,
}

/// forget --prune 的保留策略，0 表示不限制该项
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunePolicy {
    pub keep_last: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl PrunePolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last == 0
            && self.keep_daily == 0
            && self.keep_weekly == 0
            && self.keep_monthly == 0
            && self.keep_yearly == 0
    }
}

/// 恢复选项
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub target_path: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub verify: bool,
}

impl RestoreOptions {
    pub fn to(target_path: impl Into<String>) -> Self {
        Self {
            target_path: target_path.into(),
            ..Self::default()
        }
    }
}
