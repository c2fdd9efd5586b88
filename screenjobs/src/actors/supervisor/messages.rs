use super::{ExitCallback, ResetSummary, RunHandle, RunRefused};
use crate::error;
use crate::ledger::RunLogEntry;
use crate::registry::JobRef;
use crate::types::RunId;
use std::path::PathBuf;
use tokio::sync::oneshot;

pub enum SupervisorMessage {
    Run {
        run_id: RunId,
        job: JobRef,
        on_exit: Option<ExitCallback>,
        response: oneshot::Sender<Result<RunHandle, RunRefused>>,
    },
    Stop {
        run_id: RunId,
        admin: bool,
        response: oneshot::Sender<error::Result<RunLogEntry>>,
    },
    Remove {
        job: JobRef,
        response: oneshot::Sender<error::Result<bool>>,
    },
    Reset {
        archive: Option<PathBuf>,
        response: oneshot::Sender<error::Result<ResetSummary>>,
    },
}
