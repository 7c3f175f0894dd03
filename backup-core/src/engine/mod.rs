//! 备份引擎子进程网关
//!
//! 负责组装参数和环境变量、启动进程、逐行读取输出并解析 JSON、
//! 处理取消和超时，最后给出分类后的结果。密码只通过环境变量传递。

mod command;
mod output;

pub use command::EngineCommand;
pub use output::{EngineEvent, parse_file_listing, parse_line, parse_snapshots, parse_stats};

use crate::config::EngineConfig;
use crate::constants::engine;
use crate::error::{BackupError, Result};
use crate::models::{BackupSummary, Repository};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static AUTH_FAILURE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(engine::AUTH_FAILURE_PATTERN).ok());

/// stderr 是否包含密码错误特征
pub fn is_auth_failure(stderr: &str) -> bool {
    match AUTH_FAILURE.as_ref() {
        Some(re) => re.is_match(stderr),
        None => {
            let lower = stderr.to_ascii_lowercase();
            lower.contains("wrong password") || lower.contains("no key found")
        }
    }
}

/// 进程结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// 被信号终止时退出码为 None
    Exited(Option<i32>),
    Cancelled,
    TimedOut,
}

/// 一次引擎调用的完整输出
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub command: &'static str,
    pub repository_id: i64,
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    /// stdout 中的非 JSON 行
    pub log_lines: Vec<String>,
    pub summary: Option<BackupSummary>,
    pub timeout: Option<Duration>,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(Some(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => code,
            _ => None,
        }
    }

    /// 可读的失败描述，优先使用 stderr
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        if let Some(line) = self.log_lines.iter().rev().find(|l| !l.trim().is_empty()) {
            return line.trim().to_string();
        }
        match self.termination {
            Termination::Exited(Some(code)) => format!("{} 退出码 {}", self.command, code),
            Termination::Exited(None) => format!("{} 被信号终止", self.command),
            Termination::Cancelled => format!("{} 已取消", self.command),
            Termination::TimedOut => format!("{} 执行超时", self.command),
        }
    }

    /// 按错误分类转换为 Result
    pub fn into_result(self) -> Result<Self> {
        match self.termination {
            Termination::Exited(Some(0)) => Ok(self),
            Termination::Cancelled => Err(BackupError::Cancelled),
            Termination::TimedOut => Err(BackupError::ProcessTimeout {
                secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
            Termination::Exited(code) => {
                let message = self.error_message();
                if is_auth_failure(&self.stderr) {
                    Err(BackupError::CredentialRejected {
                        repository_id: self.repository_id,
                        message,
                    })
                } else {
                    Err(BackupError::ProcessFailed {
                        exit_code: code,
                        stderr: message,
                    })
                }
            }
        }
    }
}

#[derive(Default)]
struct Collected {
    stdout: String,
    log_lines: Vec<String>,
    summary: Option<BackupSummary>,
}

impl Collected {
    fn push_line<F: FnMut(EngineEvent)>(&mut self, line: String, on_event: &mut F) {
        self.stdout.push_str(&line);
        self.stdout.push('\n');

        let event = parse_line(&line);
        match &event {
            EngineEvent::Summary(summary) => self.summary = Some(summary.clone()),
            EngineEvent::Log(text) if !text.trim().is_empty() => {
                self.log_lines.push(text.clone())
            }
            _ => {}
        }
        on_event(event);
    }
}

/// 备份引擎网关
#[derive(Debug, Clone)]
pub struct EngineGateway {
    binary: String,
    timeout: Duration,
}

impl EngineGateway {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.binary, Duration::from_secs(config.timeout_secs))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 启动前检查引擎可执行文件
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        let binary = self.binary.trim();
        if binary.is_empty() {
            return Err(BackupError::configuration("未配置备份引擎路径"));
        }

        let candidate = Path::new(binary);
        if candidate.is_absolute() || candidate.components().count() > 1 {
            let metadata = std::fs::metadata(candidate).map_err(|_| {
                BackupError::configuration(format!("备份引擎不存在: {}", candidate.display()))
            })?;
            if !metadata.is_file() {
                return Err(BackupError::configuration(format!(
                    "备份引擎不是文件: {}",
                    candidate.display()
                )));
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if metadata.permissions().mode() & 0o111 == 0 {
                    return Err(BackupError::configuration(format!(
                        "备份引擎没有执行权限: {}",
                        candidate.display()
                    )));
                }
            }
            return Ok(candidate.to_path_buf());
        }

        which::which(binary).map_err(|e| {
            BackupError::configuration(format!("在 PATH 中找不到备份引擎 {binary}: {e}"))
        })
    }

    fn build_command(
        &self,
        program: &Path,
        repository: Option<(&Repository, &SecretString)>,
        command: &EngineCommand,
    ) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(command.to_args());

        for var in engine::INHERITED_PASSWORD_VARS {
            cmd.env_remove(var);
        }
        if let Some((repository, secret)) = repository {
            cmd.env(engine::ENV_REPOSITORY, repository.connection_string());
            cmd.env(engine::ENV_PASSWORD, secret.expose_secret());
            for (key, value) in repository.backend_env() {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// 获取引擎版本
    pub async fn version(&self) -> Result<String> {
        let program = self.resolve_binary()?;
        let command = EngineCommand::Version;
        let cmd = self.build_command(&program, None, &command);
        let output = self
            .run_process(cmd, &command, 0, Some(self.timeout), &CancellationToken::new(), |_| {})
            .await?
            .into_result()?;
        Ok(output.stdout.trim().to_string())
    }

    /// 执行子命令，不转发进度
    pub async fn execute(
        &self,
        repository: &Repository,
        secret: &SecretString,
        command: &EngineCommand,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput> {
        self.execute_streaming(repository, secret, command, cancel, |_| {})
            .await
    }

    /// 执行子命令并按错误分类返回
    pub async fn execute_checked(
        &self,
        repository: &Repository,
        secret: &SecretString,
        command: &EngineCommand,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput> {
        self.execute(repository, secret, command, cancel)
            .await?
            .into_result()
    }

    /// 执行子命令，逐行回调解析结果
    ///
    /// 只有启动前的检查失败和进程无法启动会返回 Err；
    /// 进程退出后的成败由 [`EngineOutput::into_result`] 判定。
    pub async fn execute_streaming<F>(
        &self,
        repository: &Repository,
        secret: &SecretString,
        command: &EngineCommand,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<EngineOutput>
    where
        F: FnMut(EngineEvent) + Send,
    {
        let program = self.resolve_binary()?;
        let cmd = self.build_command(&program, Some((repository, secret)), command);
        let timeout = if command.is_long_running() {
            None
        } else {
            Some(self.timeout)
        };
        self.run_process(cmd, command, repository.id, timeout, cancel, on_event)
            .await
    }

    async fn run_process<F>(
        &self,
        mut cmd: Command,
        command: &EngineCommand,
        repository_id: i64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<EngineOutput>
    where
        F: FnMut(EngineEvent) + Send,
    {
        info!(
            command = command.name(),
            repository_id, "启动备份引擎: {}", self.binary
        );

        let mut child = cmd.spawn().map_err(|e| {
            BackupError::ProcessLaunch(format!("{} {}: {}", self.binary, command.name(), e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::ProcessLaunch("无法获取引擎 stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackupError::ProcessLaunch("无法获取引擎 stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("引擎 stderr: {}", line);
                captured.push_str(&line);
                captured.push('\n');
            }
            captured
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut collected = Collected::default();

        let deadline = timeout.map(|t| Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let interrupted = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => collected.push_line(line, &mut on_event),
                    Ok(None) => break None,
                    Err(e) => {
                        warn!("读取引擎输出失败: {}", e);
                        break None;
                    }
                },
                _ = cancel.cancelled() => break Some(Termination::Cancelled),
                _ = &mut expired => break Some(Termination::TimedOut),
            }
        };

        let graceful = command.stops_gracefully();
        let termination = match interrupted {
            Some(termination) => {
                stop(&mut child, graceful && termination == Termination::Cancelled).await;
                // 保留终止前已经输出的内容
                let drain = async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        collected.push_line(line, &mut on_event);
                    }
                };
                let _ = tokio::time::timeout(
                    Duration::from_secs(engine::DRAIN_TIMEOUT_SECS),
                    drain,
                )
                .await;
                termination
            }
            None => {
                tokio::select! {
                    status = child.wait() => Termination::Exited(status?.code()),
                    _ = cancel.cancelled() => {
                        stop(&mut child, graceful).await;
                        Termination::Cancelled
                    }
                    _ = &mut expired => {
                        terminate(&mut child).await;
                        Termination::TimedOut
                    }
                }
            }
        };

        let stderr = match tokio::time::timeout(
            Duration::from_secs(engine::DRAIN_TIMEOUT_SECS),
            stderr_task,
        )
        .await
        {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                warn!("读取引擎 stderr 的任务异常: {}", e);
                String::new()
            }
            Err(_) => {
                warn!("等待引擎 stderr 超时");
                String::new()
            }
        };

        match termination {
            Termination::Exited(Some(0)) => {
                info!(command = command.name(), repository_id, "备份引擎执行完成")
            }
            Termination::Exited(code) => warn!(
                command = command.name(),
                repository_id,
                exit_code = ?code,
                "备份引擎执行失败"
            ),
            Termination::Cancelled => {
                info!(command = command.name(), repository_id, "备份引擎已取消")
            }
            Termination::TimedOut => warn!(
                command = command.name(),
                repository_id, "备份引擎执行超时，已强制终止"
            ),
        }

        Ok(EngineOutput {
            command: command.name(),
            repository_id,
            termination,
            stdout: collected.stdout,
            stderr,
            log_lines: collected.log_lines,
            summary: collected.summary,
            timeout,
        })
    }
}

/// 结束子进程；`graceful` 时先发送 SIGINT，宽限期内没有退出再强制终止
async fn stop(child: &mut Child, graceful: bool) {
    if graceful && interrupt(child).await {
        return;
    }
    terminate(child).await;
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("终止备份引擎进程失败: {}", e);
    }
}

/// 发送 SIGINT 并等待进程自行退出，返回是否已退出
#[cfg(unix)]
async fn interrupt(child: &mut Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // 已经退出
    let Some(pid) = child.id() else {
        return true;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!("向备份引擎发送 SIGINT 失败: {}", e);
        return false;
    }
    debug!(pid, "已发送 SIGINT，等待备份引擎退出");

    let grace = Duration::from_secs(engine::INTERRUPT_GRACE_SECS);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!("等待备份引擎退出失败: {}", e);
            false
        }
        Err(_) => {
            warn!(
                "备份引擎在 {} 秒内没有退出，强制终止",
                engine::INTERRUPT_GRACE_SECS
            );
            false
        }
    }
}

#[cfg(not(unix))]
async fn interrupt(_child: &mut Child) -> bool {
    false
}
