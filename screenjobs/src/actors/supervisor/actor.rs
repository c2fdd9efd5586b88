use super::messages::SupervisorMessage;
use super::{ExitCallback, ResetSummary, RunHandle, RunRefused};
use crate::actors::relay::RelayHandle;
use crate::actors::worker::{self, RunContext, WorkerHandle};
use crate::archive;
use crate::context::Context;
use crate::error::{self, Error};
use crate::job::JobStatus;
use crate::ledger::{Completion, Ledger, NewRun, RunLogEntry};
use crate::registry::{JobRef, JobRegistry};
use crate::stage;
use crate::types::{ExitReason, JobId, RunId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use wire::client::ClientArgs;

pub struct Supervisor {
    ctx: Arc<Context>,
    inbox: mpsc::Receiver<SupervisorMessage>,
    workers: HashMap<RunId, WorkerHandle>,
    finished_tx: mpsc::UnboundedSender<RunId>,
    finished_rx: mpsc::UnboundedReceiver<RunId>,
}

/// Puts a job back to Idle unless the start went through.
struct StartGuard<'a> {
    registry: &'a JobRegistry,
    job: JobId,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(registry: &'a JobRegistry, job: JobId) -> Self {
        Self {
            registry,
            job,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.registry.abort_start(&self.job) {
                tracing::error!(job = %self.job.short(), error = %e, "could not roll back start");
            }
        }
    }
}

impl Supervisor {
    pub fn spawn(ctx: Arc<Context>, inbox: mpsc::Receiver<SupervisorMessage>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let actor = Self {
            ctx,
            inbox,
            workers: HashMap::new(),
            finished_tx,
            finished_rx,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use SupervisorMessage::*;
        loop {
            tokio::select! {
                maybe_msg = self.inbox.recv() => {
                    let msg = match maybe_msg {
                        Some(msg) => msg,
                        // every handle dropped; dropping the workers kills their runs
                        None => return,
                    };
                    match msg {
                        Run { run_id, job, on_exit, response } => {
                            let started = self
                                .start_run(run_id, job, on_exit)
                                .await
                                .map_err(|reason| RunRefused { run_id, reason });
                            let _ = response.send(started);
                        }
                        Stop { run_id, admin, response } => {
                            self.stop_run(run_id, ExitReason::for_stop(admin), response);
                        }
                        Remove { job, response } => {
                            let _ = response.send(self.remove_job(job).await);
                        }
                        Reset { archive, response } => {
                            let _ = response.send(self.reset(archive.as_deref()).await);
                        }
                    }
                }
                Some(run_id) = self.finished_rx.recv() => {
                    self.workers.remove(&run_id);
                }
            }
        }
    }

    async fn start_run(
        &mut self,
        run_id: RunId,
        job: JobRef,
        on_exit: Option<ExitCallback>,
    ) -> error::Result<RunHandle> {
        let ctx = self.ctx.clone();
        let run = run_id.short();
        let job = ctx.registry.resolve(job)?;
        let short = job.short_id();
        tracing::debug!(%run, job = %short, "starting run");

        for (what, path) in [
            ("interpreter", job.interpreter_path.clone()),
            ("entry file", job.entry_path()),
            ("run directory", job.run_dir.clone()),
        ] {
            if !path.exists() {
                tracing::error!(%run, job = %short, path = %path.display(), "{} does not exist", what);
                return Err(Error::Precondition(format!(
                    "{} {} does not exist",
                    what,
                    path.display()
                )));
            }
        }

        let job = ctx.registry.begin_start(&job.id, job.run_privilege)?;
        let guard = StartGuard::new(&ctx.registry, job.id);

        if let Err(e) = stage::stage(&job.storage_path, &job.run_dir).await {
            tracing::error!(%run, job = %short, error = %e, "could not stage files");
            return Err(e.into());
        }

        let sandbox = &ctx.config.sandbox;
        let screen = &ctx.config.screen;
        let (slot, relay, client_args) = if job.is_hardware() {
            let slot = ctx
                .ledger
                .reserve_hardware(run_id, Some(job.id))
                .map_err(|e| {
                    tracing::warn!(%run, job = %short, error = %e, "screen is busy");
                    e
                })?;
            // programs refuse to start while the reservation stands
            if let Some(program) = ctx.programs.pause(true).await {
                tracing::info!(%run, program, "paused screen program for hardware run");
            }
            let ipc = &ctx.config.ipc;
            let relay =
                RelayHandle::bind(&ipc.host, ctx.screen.clone(), ipc.poll_interval()).await?;
            let args = ClientArgs::relayed(
                screen.width,
                screen.height,
                &ipc.host,
                relay.local_addr().port(),
            );
            (Some(slot), Some(relay), args)
        } else {
            (None, None, ClientArgs::simulated(screen.width, screen.height))
        };

        let mut child = worker::command(&job, &client_args.to_args(), sandbox).spawn()?;
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(Error::Precondition(
                    "process exited before it could be recorded".into(),
                ))
            }
        };
        tracing::info!(%run, job = %short, pid, privilege = ?job.run_privilege, "spawned");

        let run_path = job.run_path();
        let entry = ctx.ledger.create(NewRun {
            id: Some(run_id),
            pid,
            interpreter_path: &job.interpreter_path,
            run_path: &run_path,
            privilege: job.run_privilege,
            job: Some(job.id),
            owner: job.owner.clone(),
        });
        if let Err(e) = entry {
            abandon(&mut child, pid).await;
            return Err(e);
        }
        // the entry now holds the screen
        drop(slot);

        if let Err(e) = ctx
            .registry
            .transition(&job.id, JobStatus::Starting, JobStatus::Running)
        {
            abandon(&mut child, pid).await;
            close_abandoned(&ctx.ledger, &run_id);
            return Err(e);
        }
        guard.disarm();

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let relay_addr = relay.as_ref().map(RelayHandle::local_addr);
        let privilege = job.run_privilege;
        let job_id = job.id;
        let worker = WorkerHandle::spawn(
            RunContext {
                run_id,
                job,
                ctx: ctx.clone(),
                relay,
                on_exit,
                outcome: outcome_tx,
                started: Instant::now(),
            },
            child,
            self.finished_tx.clone(),
        );
        self.workers.insert(run_id, worker);
        Ok(RunHandle::new(
            run_id, job_id, pid, privilege, relay_addr, outcome_rx,
        ))
    }

    fn stop_run(
        &mut self,
        run_id: RunId,
        reason: ExitReason,
        response: oneshot::Sender<error::Result<RunLogEntry>>,
    ) {
        let response = match self.workers.get(&run_id) {
            Some(worker) => match worker.stop(reason, response) {
                Ok(()) => return,
                Err(response) => {
                    self.workers.remove(&run_id);
                    response
                }
            },
            None => response,
        };
        let _ = response.send(self.stop_stale(run_id, reason));
    }

    /// Stop a run that no worker is watching, from its run log entry alone.
    fn stop_stale(&self, run_id: RunId, reason: ExitReason) -> error::Result<RunLogEntry> {
        let entry = self.ctx.ledger.open_entry(&run_id)?;
        let run = entry.short_id();
        tracing::info!(%run, pid = entry.pid, ?reason, "stopping run without a worker");
        if let Err(e) = worker::kill_process_group(entry.pid) {
            tracing::warn!(%run, pid = entry.pid, error = %e, "could not kill process group");
        }
        let entry = self.ctx.ledger.complete(&run_id, Completion::bare(reason))?;
        if let Some(job) = &entry.job {
            if let Err(e) = self.ctx.registry.finish(job) {
                tracing::warn!(%run, job = %job.short(), error = %e, "could not return job to idle");
            }
        }
        Ok(entry)
    }

    /// Stop a run and wait until its entry is finalized and its job is
    /// idle again.
    async fn stop_and_wait(&mut self, run_id: RunId, reason: ExitReason) -> Option<RunLogEntry> {
        let (tx, rx) = oneshot::channel();
        self.stop_run(run_id, reason, tx);
        match rx.await {
            Ok(Ok(entry)) => Some(entry),
            // the run ended on its own meanwhile
            Ok(Err(Error::NotFound { .. })) => None,
            Ok(Err(e)) => {
                tracing::warn!(run = %run_id.short(), error = %e, "could not stop run");
                None
            }
            Err(_) => {
                tracing::warn!(run = %run_id.short(), "run worker vanished while stopping");
                None
            }
        }
    }

    /// Runs still in flight, for one job or for all of them: those a worker
    /// watches and those only the run log knows about.
    fn runs_in_flight(&self, job: Option<JobId>) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self
            .workers
            .iter()
            .filter(|(_, worker)| job.map_or(true, |job| worker.job_id() == job))
            .map(|(run_id, _)| *run_id)
            .collect();
        for entry in self.ctx.ledger.open_entries() {
            if (job.is_none() || entry.job == job) && !runs.contains(&entry.id) {
                runs.push(entry.id);
            }
        }
        runs
    }

    async fn remove_job(&mut self, job: JobRef) -> error::Result<bool> {
        let job = match self.ctx.registry.resolve(job) {
            Ok(job) => job,
            Err(Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        for run_id in self.runs_in_flight(Some(job.id)) {
            if self.stop_and_wait(run_id, ExitReason::System).await.is_some() {
                tracing::info!(run = %run_id.short(), job = %job.short_id(), "stopped run of removed job");
            }
        }
        self.ctx.registry.remove(job.id).await
    }

    async fn reset(&mut self, archive_dir: Option<&Path>) -> error::Result<ResetSummary> {
        let ctx = self.ctx.clone();
        let mut summary = ResetSummary::default();

        ctx.programs.stop().await;
        for run_id in self.runs_in_flight(None) {
            if self.stop_and_wait(run_id, ExitReason::System).await.is_some() {
                summary.stopped_runs += 1;
            }
        }
        self.workers.clear();

        let jobs = ctx.registry.jobs();
        if let Some(dir) = archive_dir {
            for job in &jobs {
                match archive::archive_job(job, dir).await {
                    Ok(Some(_)) => summary.archived_jobs += 1,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(job = %job.short_id(), error = %e, "could not archive job; reset abandoned before removing anything");
                        return Err(e);
                    }
                }
            }
        }
        for job in &jobs {
            match ctx.registry.remove(job.id).await {
                Ok(true) => summary.removed_jobs += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(job = %job.short_id(), error = %e, "could not remove job"),
            }
        }
        summary.cleared_runs = ctx.ledger.clear();
        tracing::info!(
            stopped = summary.stopped_runs,
            archived = summary.archived_jobs,
            removed = summary.removed_jobs,
            cleared = summary.cleared_runs,
            "reset"
        );
        Ok(summary)
    }
}

/// Kill a child whose run could not be recorded.
async fn abandon(child: &mut tokio::process::Child, pid: u32) {
    if let Err(e) = worker::kill_process_group(pid) {
        tracing::warn!(pid, error = %e, "could not kill process group");
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

/// Close the entry of a run killed before a worker took it over. A failure
/// leaves the entry open, so it is logged loudly.
fn close_abandoned(ledger: &Ledger, run_id: &RunId) {
    if let Err(e) = ledger.complete(run_id, Completion::bare(ExitReason::System)) {
        tracing::error!(run = %run_id.short(), error = %e, "could not close run log of abandoned run");
    }
}
