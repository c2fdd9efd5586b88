use crate::error;
use crate::ledger::RunLogEntry;
use crate::types::ExitReason;
use tokio::sync::oneshot;

pub enum WorkerMessage {
    Stop {
        reason: ExitReason,
        response: oneshot::Sender<error::Result<RunLogEntry>>,
    },
}
