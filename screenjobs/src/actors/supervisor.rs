mod actor;
mod messages;

use self::actor::Supervisor;
use self::messages::SupervisorMessage::{self, Remove, Reset, Run, Stop};
use crate::context::Context;
use crate::error::{self, Error};
use crate::ledger::RunLogEntry;
use crate::registry::JobRef;
use crate::types::{ExitReason, JobId, RunId, RunPrivilege};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Called once when a run ends, with its return code, stdout and stderr.
pub type ExitCallback = Box<dyn FnOnce(RunId, Option<i32>, String, String) + Send>;

/// A run that was refused before its process started. The id is still
/// allocated so the attempt can be traced in the logs.
#[derive(thiserror::Error, Debug)]
#[error("run {run_id} refused: {reason}")]
pub struct RunRefused {
    pub run_id: RunId,
    #[source]
    pub reason: Error,
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub job_id: JobId,
    pub exit_reason: ExitReason,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub job_id: JobId,
    pub pid: u32,
    pub privilege: RunPrivilege,
    /// Where the run's relay listens, for hardware runs.
    pub relay_addr: Option<SocketAddr>,
    outcome: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
    /// Wait for the run to end.
    pub async fn wait(self) -> error::Result<RunOutcome> {
        self.outcome.await.map_err(|_| Error::SupervisorGone)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub stopped_runs: usize,
    pub archived_jobs: usize,
    pub removed_jobs: usize,
    pub cleared_runs: usize,
}

/// Starts and stops runs.
///
/// This is an actor handle: runs are started one at a time by the actor
/// spawned in `SupervisorHandle::spawn`, which is what makes the screen
/// exclusivity check and the reservation a single step. The handle can be
/// cloned freely.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorMessage>,
    ctx: Arc<Context>,
}

impl SupervisorHandle {
    /// Spawn a supervisor. `message_capacity` bounds its inbound queue.
    pub fn spawn(ctx: Arc<Context>, message_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(message_capacity);
        Supervisor::spawn(ctx.clone(), receiver);
        Self { sender, ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Start a run of `job`. `on_exit` is called when the run ends.
    pub async fn run(
        &self,
        job: impl Into<JobRef>,
        on_exit: Option<ExitCallback>,
    ) -> Result<RunHandle, RunRefused> {
        let run_id = RunId::new();
        let gone = || RunRefused {
            run_id,
            reason: Error::SupervisorGone,
        };
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Run {
                run_id,
                job: job.into(),
                on_exit,
                response: tx,
            })
            .await
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Stop an open run. Returns its finalized run log entry.
    pub async fn stop(&self, run_id: RunId, admin: bool) -> error::Result<RunLogEntry> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Stop {
                run_id,
                admin,
                response: tx,
            })
            .await
            .map_err(|_| Error::SupervisorGone)?;
        rx.await.map_err(|_| Error::SupervisorGone)?
    }

    /// Remove a job, stopping its run first if it has one. Returns whether
    /// the job existed.
    pub async fn remove(&self, job: impl Into<JobRef>) -> error::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Remove {
                job: job.into(),
                response: tx,
            })
            .await
            .map_err(|_| Error::SupervisorGone)?;
        rx.await.map_err(|_| Error::SupervisorGone)?
    }

    /// Stop every open run, remove every job and clear the run log.
    ///
    /// With `archive`, each job's stored files are first zipped into that
    /// directory; if any archive fails nothing is removed.
    pub async fn reset(&self, archive: Option<&Path>) -> error::Result<ResetSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Reset {
                archive: archive.map(Path::to_path_buf),
                response: tx,
            })
            .await
            .map_err(|_| Error::SupervisorGone)?;
        rx.await.map_err(|_| Error::SupervisorGone)?
    }
}

impl RunHandle {
    pub(crate) fn new(
        run_id: RunId,
        job_id: JobId,
        pid: u32,
        privilege: RunPrivilege,
        relay_addr: Option<SocketAddr>,
        outcome: oneshot::Receiver<RunOutcome>,
    ) -> Self {
        Self {
            run_id,
            job_id,
            pid,
            privilege,
            relay_addr,
            outcome,
        }
    }
}
