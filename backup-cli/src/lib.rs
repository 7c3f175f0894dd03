// 私有模块声明
mod app;
mod cli;
mod commands;
mod init;
mod utils;

// 通过 pub use 精确控制对外暴露的接口
pub use app::CliApp;
pub use cli::{Cli, Commands, CredentialCommand, RepoCommand, SnapshotCommand, TaskCommand};
pub use init::{init_in, run_init};
pub use utils::{format_bytes, read_secret, setup_logging};
