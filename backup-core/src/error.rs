use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("配置文件解析失败: {0}")]
    Config(#[from] toml::de::Error),

    #[error("仓库 {repository_id} 缺少访问密码")]
    CredentialRequired { repository_id: i64 },

    #[error("仓库 {repository_id} 密码被拒绝: {message}")]
    CredentialRejected { repository_id: i64, message: String },

    #[error("加密存储模式需要先解锁主密码")]
    MasterKeyRequired,

    #[error("主密码错误")]
    MasterKeyRejected,

    #[error("无法启动备份引擎: {0}")]
    ProcessLaunch(String),

    #[error("备份引擎执行超时 ({secs} 秒)")]
    ProcessTimeout { secs: u64 },

    #[error("备份引擎执行失败 (退出码: {exit_code:?}): {stderr}")]
    ProcessFailed { exit_code: Option<i32>, stderr: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("已有操作正在运行: {0}")]
    AlreadyRunning(String),

    #[error("DuckDB数据库错误: {0}")]
    Persistence(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("任务执行错误: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("加密错误: {0}")]
    Crypto(String),

    #[error("参数无效: {0}")]
    InvalidInput(String),
}

impl From<duckdb::Error> for BackupError {
    fn from(err: duckdb::Error) -> Self {
        BackupError::Persistence(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Configuration(err.to_string())
    }
}

impl BackupError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_running(msg: impl Into<String>) -> Self {
        Self::AlreadyRunning(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// 是否为仓库密码被拒绝
    pub fn is_credential_rejected(&self) -> bool {
        matches!(self, Self::CredentialRejected { .. })
    }
}
