mod credential;
mod daemon;
mod repo;
mod snapshot;
mod task;

// Repository commands
pub use repo::run_repo_command;

// Task commands
pub use task::run_task_command;

// Snapshot commands
pub use snapshot::run_snapshot_command;

// Credential commands
pub use credential::run_credential_command;

// Daemon
pub use daemon::run_daemon;
