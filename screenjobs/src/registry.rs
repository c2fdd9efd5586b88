//! Job registry: creates jobs, resolves them, owns their files and records
//! their state transitions.

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus};
use crate::provision::Provisioner;
use crate::store::Persistence;
use crate::types::{JobId, OwnerRef, RunPrivilege};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a caller asks for when creating a job.
#[derive(Clone, Debug, Default)]
pub struct JobSpec {
    pub owner: Option<OwnerRef>,
    pub run_privilege: RunPrivilege,
    /// Seconds; at least 1 when set.
    pub max_runtime_secs: Option<u64>,
    /// Initial contents of the entry file. Empty when absent.
    pub code: Option<String>,
}

/// Either a job's identifier (as parsed or as text) or a job record itself.
#[derive(Clone, Debug)]
pub enum JobRef {
    Id(JobId),
    Token(String),
    Handle(Job),
}

impl From<JobId> for JobRef {
    fn from(id: JobId) -> Self {
        JobRef::Id(id)
    }
}

impl From<&str> for JobRef {
    fn from(token: &str) -> Self {
        JobRef::Token(token.to_string())
    }
}

impl From<Job> for JobRef {
    fn from(job: Job) -> Self {
        JobRef::Handle(job)
    }
}

impl From<&Job> for JobRef {
    fn from(job: &Job) -> Self {
        JobRef::Handle(job.clone())
    }
}

pub struct JobRegistry {
    config: SandboxConfig,
    store: Arc<dyn Persistence>,
    provisioner: Arc<dyn Provisioner>,
}

fn require_dir(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(Error::Configuration(format!(
            "{} directory {} does not exist",
            what,
            path.display()
        )));
    }
    Ok(path.canonicalize()?)
}

impl JobRegistry {
    pub fn new(
        config: SandboxConfig,
        store: Arc<dyn Persistence>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            config,
            store,
            provisioner,
        }
    }

    /// Create a job: allocate its id and directories, provision its
    /// environment and write its record.
    pub async fn create(&self, spec: JobSpec) -> Result<Job> {
        let envs_dir = require_dir(&self.config.envs_dir, "environments")?;
        let storage_dir = require_dir(&self.config.storage_dir, "storage")?;
        let run_root = require_dir(&self.config.run_dir, "run")?;
        if self.config.entrypoint.is_empty() {
            return Err(Error::Configuration("entry file name is empty".into()));
        }
        if spec.max_runtime_secs == Some(0) {
            return Err(Error::Configuration(
                "maximum runtime must be at least 1 second".into(),
            ));
        }

        let mut id = JobId::new();
        while self.store.job(&id).is_some() {
            tracing::info!("one in a zillion just happened: job id collision");
            id = JobId::new();
        }
        let short = id.short();
        tracing::debug!(job = %short, "creating job");

        let env_path = envs_dir.join(id.to_string());
        let storage_path = storage_dir.join(id.to_string());
        let run_dir = run_root.join(id.to_string());
        let interpreter_path = match self
            .lay_out(&short, &env_path, &storage_path, &run_dir, spec.code.as_deref())
            .await
        {
            Ok(interpreter_path) => interpreter_path,
            Err(e) => {
                tracing::error!(job = %short, error = %e, "could not lay out job directories");
                purge(&short, &env_path, &storage_path, &run_dir).await;
                return Err(e);
            }
        };

        let job = Job {
            id,
            created_at: Utc::now(),
            env_path,
            storage_path,
            run_dir,
            interpreter_path,
            entry_file_name: self.config.entrypoint.clone(),
            run_privilege: spec.run_privilege,
            max_runtime_secs: spec.max_runtime_secs,
            run_target: None,
            status: JobStatus::Idle,
            owner: spec.owner,
        };
        if let Err(job) = self.store.insert_job(job.clone()) {
            purge(&short, &job.env_path, &job.storage_path, &job.run_dir).await;
            return Err(Error::Conflict(format!("job {} already exists", job.id)));
        }
        tracing::info!(job = %short, privilege = ?job.run_privilege, "created job");
        Ok(job)
    }

    /// Make the job's three directories, provision its environment and
    /// write its entry file. Returns the interpreter path.
    async fn lay_out(
        &self,
        short: &str,
        env_path: &Path,
        storage_path: &Path,
        run_dir: &Path,
        code: Option<&str>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(env_path).await?;
        tracing::debug!(job = %short, path = %env_path.display(), "environment directory");

        let interpreter_path = self.provisioner.interpreter_path(env_path);
        if let Err(e) = self.provisioner.provision(env_path, short).await {
            tracing::warn!(job = %short, error = %e, "provisioning failed; job will not be runnable until fixed");
        }
        tracing::debug!(job = %short, path = %interpreter_path.display(), "interpreter");

        tokio::fs::create_dir_all(storage_path).await?;
        let entry_path = storage_path.join(&self.config.entrypoint);
        tokio::fs::write(&entry_path, code.unwrap_or("")).await?;
        tracing::debug!(job = %short, path = %entry_path.display(), "entry file");

        tokio::fs::create_dir_all(run_dir).await?;
        Ok(interpreter_path)
    }

    /// Look a job up by id, token or stale handle. Always returns the current
    /// record.
    pub fn resolve(&self, job: impl Into<JobRef>) -> Result<Job> {
        let id = match job.into() {
            JobRef::Id(id) => id,
            JobRef::Handle(job) => job.id,
            JobRef::Token(token) => token
                .parse::<JobId>()
                .map_err(|_| Error::job_not_found(&token))?,
        };
        self.store.job(&id).ok_or_else(|| Error::job_not_found(id))
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.store.jobs()
    }

    /// Overwrite the job's entry file. Only allowed while the job is idle.
    pub async fn save_code(&self, job: impl Into<JobRef>, code: &str) -> Result<()> {
        let job = self.resolve(job)?;
        if job.status != JobStatus::Idle {
            return Err(Error::Conflict(format!(
                "job {} is {:?}; code can only be saved while idle",
                job.short_id(),
                job.status
            )));
        }
        let path = job.entry_path();
        tokio::fs::write(&path, code).await?;
        tracing::debug!(job = %job.short_id(), path = %path.display(), "updated entry file");
        Ok(())
    }

    /// Delete the job's files and record. Returns whether the record existed.
    ///
    /// Only idle jobs can be removed; a job with a run in flight is a
    /// conflict. `SupervisorHandle::remove` stops the run first.
    pub async fn remove(&self, job: impl Into<JobRef>) -> Result<bool> {
        let id = match self.resolve(job) {
            Ok(job) => job.id,
            Err(Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let removed = self.store.delete_job(&id, &mut |job| {
            if job.status != JobStatus::Idle {
                return Err(Error::Conflict(format!(
                    "job {} is {:?}; only idle jobs can be removed",
                    job.short_id(),
                    job.status
                )));
            }
            Ok(())
        })?;
        match removed {
            Some(job) => {
                let short = job.short_id();
                purge(&short, &job.env_path, &job.storage_path, &job.run_dir).await;
                tracing::info!(job = %short, "removed job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move a job along its status cycle, checking it is currently at `from`.
    pub(crate) fn transition(&self, id: &JobId, from: JobStatus, to: JobStatus) -> Result<Job> {
        self.store.update_job(id, &mut |job| {
            if job.status != from || !from.can_transition_to(to) {
                return Err(Error::Conflict(format!(
                    "job {} cannot go from {:?} to {:?} (currently {:?})",
                    job.short_id(),
                    from,
                    to,
                    job.status
                )));
            }
            job.status = to;
            Ok(())
        })
    }

    /// Claim an idle job for a run.
    pub(crate) fn begin_start(&self, id: &JobId, target: RunPrivilege) -> Result<Job> {
        self.store.update_job(id, &mut |job| {
            if job.status != JobStatus::Idle {
                return Err(Error::Conflict(format!(
                    "job {} is already {:?}",
                    job.short_id(),
                    job.status
                )));
            }
            job.status = JobStatus::Starting;
            job.run_target = Some(target);
            Ok(())
        })
    }

    /// Roll back a start that failed before its process spawned.
    pub(crate) fn abort_start(&self, id: &JobId) -> Result<Job> {
        self.store.update_job(id, &mut |job| {
            if job.status != JobStatus::Starting {
                return Err(Error::Conflict(format!(
                    "job {} is {:?}, not starting",
                    job.short_id(),
                    job.status
                )));
            }
            job.status = JobStatus::Idle;
            Ok(())
        })
    }

    /// Walk a running job through Stopping back to Idle.
    pub(crate) fn finish(&self, id: &JobId) -> Result<Job> {
        self.transition(id, JobStatus::Running, JobStatus::Stopping)?;
        self.transition(id, JobStatus::Stopping, JobStatus::Idle)
    }
}

/// Delete a job's trees. Each delete is attempted regardless of the others,
/// and a tree that was never made is skipped.
async fn purge(short: &str, env_path: &Path, storage_path: &Path, run_dir: &Path) {
    for (what, path) in [
        ("environment", env_path),
        ("storage", storage_path),
        ("run", run_dir),
    ] {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => tracing::debug!(job = %short, "deleted {} directory", what),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                job = %short,
                path = %path.display(),
                error = %e,
                "could not delete {} directory",
                what
            ),
        }
    }
}
