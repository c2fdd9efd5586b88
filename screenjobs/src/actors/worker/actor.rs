use super::messages::WorkerMessage;
use super::{kill_process_group, StopResponse};
use crate::actors::relay::RelayHandle;
use crate::actors::supervisor::{ExitCallback, RunOutcome};
use crate::context::Context;
use crate::error::Error;
use crate::job::Job;
use crate::ledger::Completion;
use crate::types::{ExitReason, RunId};
use bytes::BytesMut;
use futures::future::FutureExt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{future, io};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// How long to wait for the pipes to drain once the process group is gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// What a worker needs to finish a run it did not start.
pub struct RunContext {
    pub run_id: RunId,
    pub job: Job,
    pub ctx: Arc<Context>,
    pub relay: Option<RelayHandle>,
    pub on_exit: Option<ExitCallback>,
    pub outcome: oneshot::Sender<RunOutcome>,
    pub started: Instant,
}

enum Ending {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Stopped(ExitReason, Option<StopResponse>),
}

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    run: RunContext,
    finished: mpsc::UnboundedSender<RunId>,
}

impl Actor {
    pub fn spawn(
        inbox: mpsc::UnboundedReceiver<WorkerMessage>,
        run: RunContext,
        child: Child,
        finished: mpsc::UnboundedSender<RunId>,
    ) {
        let actor = Self {
            inbox,
            run,
            finished,
        };
        tokio::spawn(async move { actor.supervise(child).await });
    }

    async fn supervise(mut self, mut child: Child) {
        let run = self.run.run_id.short();
        let pid = child.id();
        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let deadline = self.run.job.max_runtime();
        let timeout = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => future::pending().await,
            }
        }
        .fuse();
        tokio::pin!(timeout);

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = &mut timeout => Ending::TimedOut,
            msg = self.inbox.recv() => match msg {
                Some(WorkerMessage::Stop { reason, response }) => Ending::Stopped(reason, Some(response)),
                // supervisor gone; nobody is left to stop this run
                None => Ending::Stopped(ExitReason::System, None),
            },
        };

        let (reason, status, stop_response) = match ending {
            Ending::Exited(status) => (ExitReason::Natural, status, None),
            Ending::TimedOut => {
                tracing::info!(%run, ?pid, limit = ?deadline, "run timed out");
                kill(&mut child, pid);
                (ExitReason::Timeout, child.wait().await, None)
            }
            Ending::Stopped(reason, response) => {
                tracing::info!(%run, ?pid, ?reason, "stopping run");
                kill(&mut child, pid);
                (reason, child.wait().await, response)
            }
        };
        // reap anything the program left behind
        if let Some(pid) = pid {
            if let Err(e) = kill_process_group(pid) {
                tracing::warn!(%run, pid, error = %e, "could not kill process group");
            }
        }

        let return_code = match status {
            Ok(status) => status.code().or_else(|| status.signal().map(|signal| -signal)),
            Err(e) => {
                tracing::error!(%run, error = %e, "could not wait for child");
                None
            }
        };
        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;
        self.finalize(reason, return_code, stdout, stderr, stop_response)
            .await;
    }

    async fn finalize(
        mut self,
        reason: ExitReason,
        return_code: Option<i32>,
        stdout: String,
        stderr: String,
        stop_response: Option<StopResponse>,
    ) {
        let RunContext {
            run_id,
            job,
            ctx,
            relay,
            on_exit,
            outcome,
            started,
        } = self.run;
        let run = run_id.short();

        if let Some(relay) = relay {
            let stats = relay.join().await;
            tracing::debug!(%run, handled = stats.handled, rejected = stats.rejected, "relay closed");
        }

        let entry = ctx.ledger.complete(
            &run_id,
            Completion {
                reason,
                return_code,
                stdout: Some(stdout.clone()),
                stderr: Some(stderr.clone()),
            },
        );
        if let Err(e) = &entry {
            tracing::error!(%run, error = %e, "could not finalize run log");
        }
        if let Err(e) = ctx.registry.finish(&job.id) {
            tracing::error!(%run, job = %job.short_id(), error = %e, "could not return job to idle");
        }

        let elapsed = started.elapsed();
        tracing::info!(
            %run,
            job = %job.short_id(),
            ?return_code,
            ?reason,
            elapsed = ?elapsed,
            "run exited"
        );

        if let Some(on_exit) = on_exit {
            on_exit(run_id, return_code, stdout.clone(), stderr.clone());
        }
        if let Some(response) = stop_response {
            let _ = response.send(entry);
        }
        let _ = outcome.send(RunOutcome {
            run_id,
            job_id: job.id,
            exit_reason: reason,
            return_code,
            stdout,
            stderr,
            elapsed,
        });

        // stops that raced the exit find the run already closed
        self.inbox.close();
        while let Ok(WorkerMessage::Stop { response, .. }) = self.inbox.try_recv() {
            let _ = response.send(Err(Error::run_not_found(run_id)));
        }
        let _ = self.finished.send(run_id);
    }
}

fn kill(child: &mut Child, pid: Option<u32>) {
    let killed = match pid {
        Some(pid) => kill_process_group(pid),
        None => Ok(()),
    };
    if let Err(e) = killed {
        tracing::warn!(?pid, error = %e, "could not kill process group, killing child only");
        let _ = child.start_kill();
    }
}

fn collect<R>(mut pipe: R) -> JoinHandle<BytesMut>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match pipe.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {}
                _ => break,
            }
        }
        buf
    })
}

async fn drain(reader: Option<JoinHandle<BytesMut>>) -> String {
    let reader = match reader {
        Some(reader) => reader,
        None => return String::new(),
    };
    match tokio::time::timeout(OUTPUT_GRACE, reader).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "output reader failed");
            String::new()
        }
        Err(_) => {
            tracing::warn!("output pipe still open after the process group was killed");
            String::new()
        }
    }
}
