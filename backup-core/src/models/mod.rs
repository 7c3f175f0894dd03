pub mod repository;
pub mod run_result;
pub mod schedule;
pub mod snapshot;
pub mod task;

pub use repository::{BackendType, Repository};
pub use run_result::{BackupSummary, RunOutcome, RunResult};
pub use schedule::{Recurrence, Schedule};
pub use snapshot::{FileEntry, FileKind, PrunePolicy, RepoStats, RestoreOptions, Snapshot};
pub use task::{BackupTask, EngineOptions};
