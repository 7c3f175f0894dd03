use crate::constants::engine;
use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 仓库后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    Sftp,
    S3,
    Rest,
    Azure,
    Gs,
    B2,
    Rclone,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Local => "local",
            BackendType::Sftp => "sftp",
            BackendType::S3 => "s3",
            BackendType::Rest => "rest",
            BackendType::Azure => "azure",
            BackendType::Gs => "gs",
            BackendType::B2 => "b2",
            BackendType::Rclone => "rclone",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendType::Local),
            "sftp" => Ok(BackendType::Sftp),
            "s3" => Ok(BackendType::S3),
            "rest" => Ok(BackendType::Rest),
            "azure" => Ok(BackendType::Azure),
            "gs" => Ok(BackendType::Gs),
            "b2" => Ok(BackendType::B2),
            "rclone" => Ok(BackendType::Rclone),
            other => Err(BackupError::invalid_input(format!("未知的仓库类型: {other}"))),
        }
    }
}

/// 后端配置项与引擎环境变量的对应关系
const BACKEND_ENV_KEYS: &[(BackendType, &str, &str)] = &[
    (BackendType::S3, "access_key_id", "AWS_ACCESS_KEY_ID"),
    (BackendType::S3, "secret_access_key", "AWS_SECRET_ACCESS_KEY"),
    (BackendType::S3, "region", "AWS_DEFAULT_REGION"),
    (BackendType::B2, "account_id", "B2_ACCOUNT_ID"),
    (BackendType::B2, "account_key", "B2_ACCOUNT_KEY"),
    (BackendType::Azure, "account_name", "AZURE_ACCOUNT_NAME"),
    (BackendType::Azure, "account_key", "AZURE_ACCOUNT_KEY"),
    (BackendType::Gs, "project_id", "GOOGLE_PROJECT_ID"),
    (
        BackendType::Gs,
        "credentials_file",
        "GOOGLE_APPLICATION_CREDENTIALS",
    ),
    (BackendType::Rest, "username", "RESTIC_REST_USERNAME"),
    (BackendType::Rest, "password", "RESTIC_REST_PASSWORD"),
];

/// 备份仓库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// 未保存时为 0
    pub id: i64,
    pub name: String,
    pub backend: BackendType,
    /// 本地路径、远程路径或桶名，视后端而定
    pub path: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_default: bool,
}

impl Repository {
    pub fn new(name: impl Into<String>, backend: BackendType, path: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            backend,
            path: path.into(),
            config: BTreeMap::new(),
            created_at: Utc::now(),
            last_backup: None,
            is_default: false,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BackupError::invalid_input("仓库名称不能为空"));
        }
        if self.path.trim().is_empty() && self.backend != BackendType::Sftp {
            return Err(BackupError::invalid_input("仓库路径不能为空"));
        }
        Ok(())
    }

    fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// 生成引擎使用的仓库地址
    pub fn connection_string(&self) -> String {
        match self.backend {
            BackendType::Local => self.path.clone(),
            BackendType::Sftp => {
                let Some(host) = self.config_value("host") else {
                    return prefixed("sftp:", &self.path);
                };
                let user = self
                    .config_value("user")
                    .map(|u| format!("{u}@"))
                    .unwrap_or_default();
                let port = self
                    .config_value("port")
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(engine::SFTP_DEFAULT_PORT);

                if port == engine::SFTP_DEFAULT_PORT {
                    format!("sftp:{user}{host}:{}", self.path)
                } else {
                    format!("sftp://{user}{host}:{port}/{}", self.path)
                }
            }
            BackendType::S3 => {
                if self.path.starts_with("s3:") {
                    return self.path.clone();
                }
                let endpoint = self
                    .config_value("endpoint")
                    .unwrap_or(engine::S3_DEFAULT_ENDPOINT);
                let bucket = self.config_value("bucket").unwrap_or(&self.path);
                format!("s3:{}/{}", endpoint.trim_end_matches('/'), bucket)
            }
            BackendType::Rest => prefixed("rest:", &self.path),
            BackendType::Azure => prefixed("azure:", &self.path),
            BackendType::Gs => prefixed("gs:", &self.path),
            BackendType::B2 => prefixed("b2:", &self.path),
            BackendType::Rclone => prefixed("rclone:", &self.path),
        }
    }

    /// 后端访问凭据对应的环境变量
    pub fn backend_env(&self) -> Vec<(String, String)> {
        BACKEND_ENV_KEYS
            .iter()
            .filter(|(backend, _, _)| *backend == self.backend)
            .filter_map(|(_, key, var)| {
                self.config_value(key)
                    .map(|value| (var.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn prefixed(prefix: &str, path: &str) -> String {
    if path.starts_with(prefix) {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    }
}
