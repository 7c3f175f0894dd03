/// 备份引擎相关常量
pub mod engine {
    /// 默认引擎可执行文件名
    pub const DEFAULT_BINARY: &str = "restic";

    /// 单次调用的超时上限（秒）
    pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

    /// 进程被终止后读取剩余输出的最长等待时间（秒）
    pub const DRAIN_TIMEOUT_SECS: u64 = 5;

    /// 发送 SIGINT 后等待引擎自行退出的宽限期（秒）
    pub const INTERRUPT_GRACE_SECS: u64 = 5;

    /// 仓库地址环境变量
    pub const ENV_REPOSITORY: &str = "RESTIC_REPOSITORY";

    /// 仓库密码环境变量
    pub const ENV_PASSWORD: &str = "RESTIC_PASSWORD";

    /// 会覆盖注入密码的继承环境变量，启动前移除
    pub const INHERITED_PASSWORD_VARS: &[&str] =
        &["RESTIC_PASSWORD_FILE", "RESTIC_PASSWORD_COMMAND"];

    /// stderr 中表示密码错误的特征
    pub const AUTH_FAILURE_PATTERN: &str = r"(?i)wrong password|no key found";

    /// SFTP 默认端口
    pub const SFTP_DEFAULT_PORT: u16 = 22;

    /// S3 默认端点
    pub const S3_DEFAULT_ENDPOINT: &str = "s3.amazonaws.com";
}

/// 调度器相关常量
pub mod scheduler {
    /// 轮询间隔（秒）
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
}

/// 查询结果缓存相关常量
pub mod cache {
    /// 缓存容量上限（MB）
    pub const DEFAULT_MAX_SIZE_MB: u64 = 100;

    /// 快照列表有效期（分钟）
    pub const DEFAULT_SNAPSHOT_TTL_MINUTES: u64 = 5;

    /// 仓库统计有效期（分钟）
    pub const DEFAULT_STATS_TTL_MINUTES: u64 = 10;

    /// 文件列表有效期（分钟）
    pub const DEFAULT_FILE_LISTING_TTL_MINUTES: u64 = 60;

    /// 超出容量时优先淘汰的陈旧阈值（分钟）
    pub const DEFAULT_STALE_AFTER_MINUTES: u64 = 60;

    /// 每个快照的估算占用
    pub const SNAPSHOT_ENTRY_BYTES: usize = 1024;

    /// 每个文件条目的估算占用
    pub const FILE_ENTRY_BYTES: usize = 512;

    /// 每条统计记录的估算占用
    pub const STATS_ENTRY_BYTES: usize = 4096;
}

/// 凭据缓存相关常量
pub mod credentials {
    /// 默认过期时间（分钟），0 表示永不过期
    pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;

    /// 过期清理间隔（秒）
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

    /// PBKDF2 迭代次数
    pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

    /// 盐长度
    pub const SALT_LEN: usize = 16;

    /// AES-GCM nonce 长度
    pub const NONCE_LEN: usize = 12;

    /// 用于校验主密码的明文
    pub const VERIFIER_PLAINTEXT: &[u8] = b"backup-core-master-key-check";

    /// 设置项：主密码盐（hex）
    pub const SETTING_MASTER_SALT: &str = "credentials.master_salt";

    /// 设置项：主密码校验密文（hex）
    pub const SETTING_MASTER_VERIFIER: &str = "credentials.master_verifier";

    /// 设置项：存储模式
    pub const SETTING_STORAGE_MODE: &str = "credentials.storage_mode";

    /// 设置项：过期时间
    pub const SETTING_TIMEOUT_MINUTES: &str = "credentials.timeout_minutes";
}

/// 配置文件相关常量
pub mod config {
    /// 按优先级查找的配置文件名
    pub const CONFIG_FILE_CANDIDATES: &[&str] = &["backup.toml", ".backup.toml"];

    /// 默认配置文件名
    pub const DEFAULT_CONFIG_FILE: &str = "backup.toml";

    /// 默认数据库文件路径
    pub const DEFAULT_DATABASE_PATH: &str = "./data/backup.db";
}
