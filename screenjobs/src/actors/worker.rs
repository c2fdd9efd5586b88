mod actor;
mod messages;

use self::actor::Actor;
pub(crate) use self::actor::RunContext;
use self::messages::WorkerMessage;
use crate::config::SandboxConfig;
use crate::error;
use crate::job::Job;
use crate::ledger::RunLogEntry;
use crate::types::{ExitReason, JobId, RunId};
use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

const SYSTEM_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub type StopResponse = oneshot::Sender<error::Result<RunLogEntry>>;

/// Handle to the task that owns one run's child process.
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    job_id: JobId,
}

impl WorkerHandle {
    pub fn spawn(run: RunContext, child: Child, finished: mpsc::UnboundedSender<RunId>) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        let job_id = run.job.id;
        Actor::spawn(inbox, run, child, finished);
        Self { sender, job_id }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Kill the run and answer `response` with its finalized entry.
    ///
    /// Gives the responder back if the worker has already exited.
    pub fn stop(&self, reason: ExitReason, response: StopResponse) -> Result<(), StopResponse> {
        self.sender
            .send(WorkerMessage::Stop { reason, response })
            .map_err(|mpsc::error::SendError(msg)| match msg {
                WorkerMessage::Stop { response, .. } => response,
            })
    }
}

/// The command line and sandbox for a job's process.
///
/// The child leads its own process group, so the whole group can be killed.
pub(crate) fn command(job: &Job, args: &[String], sandbox: &SandboxConfig) -> Command {
    let path = match job.bin_dir() {
        Some(bin) => format!("{}:{}", bin.display(), SYSTEM_PATH),
        None => SYSTEM_PATH.to_string(),
    };
    let mut command = Command::new(&job.interpreter_path);
    command
        .arg(job.run_path())
        .args(args)
        .current_dir(&job.run_dir)
        .env_clear()
        .env("PATH", path)
        .env("HOME", &job.run_dir)
        .env("VIRTUAL_ENV", &job.env_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(gid) = sandbox.run_gid {
        command.gid(gid);
    }
    if let Some(uid) = sandbox.run_uid {
        command.uid(uid);
    }
    command
}

/// SIGKILL every process in the group led by `pid`. An already empty group
/// is not an error.
pub(crate) fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = match i32::try_from(pid) {
        Ok(pgid) if pgid > 0 => pgid,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a process id: {}", pid),
            ))
        }
    };
    // SAFETY: kill has no memory-safety preconditions.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}
