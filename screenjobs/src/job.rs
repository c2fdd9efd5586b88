use crate::types::{JobId, OwnerRef, RunPrivilege};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run state of a job.
///
/// The only forward edges are Idle -> Starting -> Running -> Stopping -> Idle.
/// A start that fails before its process spawns is rolled back from Starting
/// to Idle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl JobStatus {
    pub fn next(self) -> JobStatus {
        match self {
            JobStatus::Idle => JobStatus::Starting,
            JobStatus::Starting => JobStatus::Running,
            JobStatus::Running => JobStatus::Stopping,
            JobStatus::Stopping => JobStatus::Idle,
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.next() == to
    }
}

/// One user's isolated execution context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub env_path: PathBuf,
    pub storage_path: PathBuf,
    pub run_dir: PathBuf,
    pub interpreter_path: PathBuf,
    pub entry_file_name: String,
    pub run_privilege: RunPrivilege,
    pub max_runtime_secs: Option<u64>,
    /// Target of the current or most recent run.
    pub run_target: Option<RunPrivilege>,
    pub status: JobStatus,
    pub owner: Option<OwnerRef>,
}

impl Job {
    pub fn short_id(&self) -> String {
        self.id.short()
    }

    /// The entry file as stored.
    pub fn entry_path(&self) -> PathBuf {
        self.storage_path.join(&self.entry_file_name)
    }

    /// The entry file as staged for a run.
    pub fn run_path(&self) -> PathBuf {
        self.run_dir.join(&self.entry_file_name)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_secs.map(Duration::from_secs)
    }

    pub fn is_hardware(&self) -> bool {
        self.run_privilege == RunPrivilege::Hardware
    }

    pub fn bin_dir(&self) -> Option<&Path> {
        self.interpreter_path.parent()
    }
}
