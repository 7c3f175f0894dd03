use crate::error::{BackupError, Result};
use crate::events::ProgressUpdate;
use crate::models::{BackupSummary, FileEntry, FileKind, RepoStats, Snapshot};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// 引擎 stdout 单行解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status(ProgressUpdate),
    Summary(BackupSummary),
    /// 非 JSON 行或不关心的 JSON 消息
    Log(String),
}

/// 解析一行输出，无法识别的内容作为普通日志保留
pub fn parse_line(line: &str) -> EngineEvent {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return EngineEvent::Log(line.to_string());
    }
    let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
        return EngineEvent::Log(line.to_string());
    };

    match json["message_type"].as_str() {
        Some("status") => EngineEvent::Status(parse_status(&json)),
        Some("summary") => EngineEvent::Summary(parse_summary(&json)),
        Some("error") => {
            let message = json["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| json["error"].to_string());
            match json["item"].as_str() {
                Some(item) => EngineEvent::Log(format!("{item}: {message}")),
                None => EngineEvent::Log(message),
            }
        }
        _ => EngineEvent::Log(line.to_string()),
    }
}

fn as_u64(json: &Value, key: &str) -> u64 {
    json[key].as_u64().unwrap_or(0)
}

fn parse_status(json: &Value) -> ProgressUpdate {
    ProgressUpdate {
        percent_done: json["percent_done"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0),
        bytes_done: as_u64(json, "bytes_done").max(as_u64(json, "bytes_restored")),
        total_bytes: as_u64(json, "total_bytes"),
        files_done: as_u64(json, "files_done").max(as_u64(json, "files_restored")),
        total_files: as_u64(json, "total_files"),
        current_files: json["current_files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_summary(json: &Value) -> BackupSummary {
    BackupSummary {
        snapshot_id: json["snapshot_id"].as_str().map(str::to_string),
        files_new: as_u64(json, "files_new"),
        files_changed: as_u64(json, "files_changed"),
        files_unmodified: as_u64(json, "files_unmodified"),
        dirs_new: as_u64(json, "dirs_new"),
        dirs_changed: as_u64(json, "dirs_changed"),
        dirs_unmodified: as_u64(json, "dirs_unmodified"),
        data_added: as_u64(json, "data_added"),
        total_files_processed: as_u64(json, "total_files_processed"),
        total_bytes_processed: as_u64(json, "total_bytes_processed"),
    }
}

fn string_list(json: &Value) -> Vec<String> {
    json.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_time(json: &Value) -> Option<DateTime<Utc>> {
    json.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_snapshot(json: &Value) -> Option<Snapshot> {
    Some(Snapshot {
        id: json["id"].as_str()?.to_string(),
        short_id: json["short_id"].as_str().map(str::to_string),
        time: parse_time(&json["time"])?,
        hostname: json["hostname"].as_str().unwrap_or_default().to_string(),
        username: json["username"].as_str().unwrap_or_default().to_string(),
        paths: string_list(&json["paths"]),
        tags: string_list(&json["tags"]),
        parent: json["parent"].as_str().map(str::to_string),
    })
}

/// 解析 `snapshots --json` 输出（单个 JSON 数组），无法识别的元素跳过
pub fn parse_snapshots(stdout: &str) -> Result<Vec<Snapshot>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let items: Vec<Value> = serde_json::from_str(trimmed).map_err(|e| {
        BackupError::ProcessFailed {
            exit_code: Some(0),
            stderr: format!("无法解析快照列表: {e}"),
        }
    })?;

    let mut snapshots: Vec<Snapshot> = items
        .iter()
        .filter_map(|item| {
            let parsed = parse_snapshot(item);
            if parsed.is_none() {
                debug!("跳过无法解析的快照条目: {}", item);
            }
            parsed
        })
        .collect();
    snapshots.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
    Ok(snapshots)
}

/// 解析 `stats --json` 输出
pub fn parse_stats(stdout: &str) -> Result<RepoStats> {
    let json: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
        BackupError::ProcessFailed {
            exit_code: Some(0),
            stderr: format!("无法解析仓库统计: {e}"),
        }
    })?;

    Ok(RepoStats {
        total_size: as_u64(&json, "total_size"),
        total_file_count: as_u64(&json, "total_file_count"),
        snapshots_count: as_u64(&json, "snapshots_count"),
    })
}

fn parse_node(json: &Value) -> Option<FileEntry> {
    let kind = json["struct_type"]
        .as_str()
        .or_else(|| json["message_type"].as_str());
    if matches!(kind, Some("snapshot")) {
        return None;
    }

    Some(FileEntry {
        name: json["name"].as_str()?.to_string(),
        path: json["path"].as_str()?.to_string(),
        kind: FileKind::from_engine(json["type"].as_str().unwrap_or_default()),
        size: as_u64(json, "size"),
        mode: json["mode"].as_u64().unwrap_or(0) as u32,
        mtime: parse_time(&json["mtime"]),
        uid: as_u64(json, "uid") as u32,
        gid: as_u64(json, "gid") as u32,
        user: json["user"].as_str().unwrap_or_default().to_string(),
        group: json["group"].as_str().unwrap_or_default().to_string(),
    })
}

/// 解析 `ls --json` 输出（每行一个 JSON 对象），快照头和格式错误的行被跳过
pub fn parse_file_listing(stdout: &str) -> Vec<FileEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(json) => parse_node(&json),
            Err(e) => {
                debug!("跳过无法解析的文件列表行: {} ({})", line, e);
                None
            }
        })
        .collect()
}
