//! The run log ledger: one entry per execution attempt, open while the
//! process runs and closed exactly once when it ends.

use crate::error::{Error, Result};
use crate::store::{HardwareHolder, Persistence};
use crate::types::{ExitReason, JobId, OwnerRef, RunId, RunPrivilege};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: RunId,
    pub pid: u32,
    pub interpreter_path: PathBuf,
    pub run_path: PathBuf,
    pub privilege: RunPrivilege,
    pub started_at: DateTime<Utc>,
    /// `None` while the run is in flight.
    pub stopped_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub exit_reason: Option<ExitReason>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub job: Option<JobId>,
    pub owner: Option<OwnerRef>,
}

impl RunLogEntry {
    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }

    pub fn short_id(&self) -> String {
        self.id.short()
    }
}

/// Fields of a run log entry known at spawn time.
#[derive(Clone, Debug)]
pub struct NewRun<'a> {
    /// Pre-allocated id; a fresh one is generated when absent.
    pub id: Option<RunId>,
    pub pid: u32,
    pub interpreter_path: &'a Path,
    pub run_path: &'a Path,
    pub privilege: RunPrivilege,
    pub job: Option<JobId>,
    pub owner: Option<OwnerRef>,
}

/// Fields written when a run ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub reason: ExitReason,
    pub return_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Completion {
    pub fn bare(reason: ExitReason) -> Self {
        Self {
            reason,
            return_code: None,
            stdout: None,
            stderr: None,
        }
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Persistence>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Open a new entry for a spawned process.
    ///
    /// Both paths must exist on disk at call time.
    pub fn create(&self, new: NewRun<'_>) -> Result<RunLogEntry> {
        if !new.run_path.exists() {
            return Err(Error::Precondition(format!(
                "cannot create run log for non-existent program {}",
                new.run_path.display()
            )));
        }
        if !new.interpreter_path.exists() {
            return Err(Error::Precondition(format!(
                "cannot create run log with non-existent interpreter {}",
                new.interpreter_path.display()
            )));
        }

        let mut entry = RunLogEntry {
            id: new.id.unwrap_or_default(),
            pid: new.pid,
            interpreter_path: new.interpreter_path.to_path_buf(),
            run_path: new.run_path.to_path_buf(),
            privilege: new.privilege,
            started_at: Utc::now(),
            stopped_at: None,
            return_code: None,
            exit_reason: None,
            stdout: None,
            stderr: None,
            job: new.job,
            owner: new.owner,
        };
        loop {
            match self.store.insert_run_log(entry.clone()) {
                Ok(()) => break,
                Err(taken) if new.id.is_some() => {
                    return Err(Error::Conflict(format!(
                        "run log {} already exists",
                        taken.id
                    )));
                }
                Err(_) => {
                    tracing::info!("one in a zillion just happened: run id collision");
                    entry.id = RunId::new();
                }
            }
        }
        tracing::debug!(run = %entry.short_id(), pid = entry.pid, "created run log");
        Ok(entry)
    }

    /// Close an open entry. Closing an entry twice is an error.
    pub fn complete(&self, id: &RunId, completion: Completion) -> Result<RunLogEntry> {
        let mut completion = Some(completion);
        let entry = self.store.update_run_log(id, &mut |entry| {
            if !entry.is_open() {
                return Err(Error::Conflict(format!(
                    "run log {} was already completed",
                    entry.id
                )));
            }
            if let Some(done) = completion.take() {
                entry.stopped_at = Some(Utc::now());
                entry.exit_reason = Some(done.reason);
                entry.return_code = done.return_code;
                entry.stdout = done.stdout;
                entry.stderr = done.stderr;
            }
            Ok(())
        })?;
        tracing::debug!(run = %entry.short_id(), reason = ?entry.exit_reason, "completed run log");
        Ok(entry)
    }

    pub fn get(&self, id: &RunId) -> Option<RunLogEntry> {
        self.store.run_log(id)
    }

    /// The entry, if it exists and is still open.
    pub fn open_entry(&self, id: &RunId) -> Result<RunLogEntry> {
        self.store
            .run_log(id)
            .filter(RunLogEntry::is_open)
            .ok_or_else(|| Error::run_not_found(id))
    }

    pub fn open_entries(&self) -> Vec<RunLogEntry> {
        let mut open: Vec<_> = self
            .store
            .run_logs()
            .into_iter()
            .filter(RunLogEntry::is_open)
            .collect();
        open.sort_by_key(|entry| entry.started_at);
        open
    }

    pub fn entries(&self) -> Vec<RunLogEntry> {
        let mut all = self.store.run_logs();
        all.sort_by_key(|entry| entry.started_at);
        all
    }

    pub fn clear(&self) -> usize {
        self.store.clear_run_logs()
    }

    /// The run holding the shared screen, whether its entry is open or it
    /// has only reserved the screen so far.
    pub fn hardware_holder(&self) -> Option<HardwareHolder> {
        self.store.hardware_holder()
    }

    /// Claim the shared screen for `run`.
    ///
    /// The check for an open hardware run and the claim happen in one store
    /// transaction. The claim lasts until the run's entry is created or the
    /// returned slot is dropped.
    pub fn reserve_hardware(&self, run: RunId, job: Option<JobId>) -> Result<HardwareSlot> {
        self.store
            .reserve_hardware(HardwareHolder { run, job })
            .map_err(|blocker| {
                let by = match blocker.job {
                    Some(job) => format!("job {} (run {})", job.short(), blocker.run.short()),
                    None => format!("run {}", blocker.run.short()),
                };
                Error::Conflict(format!("screen is in use by {}", by))
            })?;
        Ok(HardwareSlot {
            store: self.store.clone(),
            run,
        })
    }
}

/// A claim on the shared screen that has not yet become a run log entry.
pub struct HardwareSlot {
    store: Arc<dyn Persistence>,
    run: RunId,
}

impl HardwareSlot {
    pub fn run(&self) -> RunId {
        self.run
    }
}

impl Drop for HardwareSlot {
    fn drop(&mut self) {
        if self.store.release_hardware(&self.run) {
            tracing::debug!(run = %self.run.short(), "released unused screen reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        interpreter: PathBuf,
        program: PathBuf,
        ledger: Ledger,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let interpreter = dir.path().join("python3");
        let program = dir.path().join("main.py");
        std::fs::write(&interpreter, "").unwrap();
        std::fs::write(&program, "").unwrap();
        Fixture {
            _dir: dir,
            interpreter,
            program,
            ledger: Ledger::new(Arc::new(MemoryStore::new())),
        }
    }

    fn new_run<'a>(f: &'a Fixture, privilege: RunPrivilege) -> NewRun<'a> {
        NewRun {
            id: None,
            pid: 4242,
            interpreter_path: &f.interpreter,
            run_path: &f.program,
            privilege,
            job: Some(JobId::new()),
            owner: Some(OwnerRef("ABCD1234".into())),
        }
    }

    #[test]
    fn create_requires_existing_paths() {
        let f = fixture();
        let missing = f.program.with_file_name("nope.py");
        let mut run = new_run(&f, RunPrivilege::Simulate);
        run.run_path = &missing;
        assert!(matches!(f.ledger.create(run), Err(Error::Precondition(_))));

        let mut run = new_run(&f, RunPrivilege::Simulate);
        run.interpreter_path = &missing;
        assert!(matches!(f.ledger.create(run), Err(Error::Precondition(_))));
        assert!(f.ledger.entries().is_empty());
    }

    #[test]
    fn complete_closes_exactly_once() {
        let f = fixture();
        let entry = f.ledger.create(new_run(&f, RunPrivilege::Simulate)).unwrap();
        assert!(entry.is_open());

        let done = f
            .ledger
            .complete(
                &entry.id,
                Completion {
                    reason: ExitReason::Natural,
                    return_code: Some(0),
                    stdout: Some("hi".into()),
                    stderr: None,
                },
            )
            .unwrap();
        assert!(!done.is_open());
        assert_eq!(done.exit_reason, Some(ExitReason::Natural));
        assert_eq!(done.return_code, Some(0));

        let again = f
            .ledger
            .complete(&entry.id, Completion::bare(ExitReason::Admin));
        assert!(matches!(again, Err(Error::Conflict(_))));
        assert_eq!(
            f.ledger.get(&entry.id).unwrap().exit_reason,
            Some(ExitReason::Natural)
        );
    }

    #[test]
    fn complete_unknown_run_is_not_found() {
        let f = fixture();
        let result = f
            .ledger
            .complete(&RunId::new(), Completion::bare(ExitReason::System));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn open_hardware_entry_blocks_reservation() {
        let f = fixture();
        let slot = f.ledger.reserve_hardware(RunId::new(), None).unwrap();
        let mut run = new_run(&f, RunPrivilege::Hardware);
        run.id = Some(slot.run());
        let entry = f.ledger.create(run).unwrap();
        drop(slot);

        let refused = f.ledger.reserve_hardware(RunId::new(), None);
        assert!(matches!(refused, Err(Error::Conflict(_))));

        f.ledger
            .complete(&entry.id, Completion::bare(ExitReason::Natural))
            .unwrap();
        assert!(f.ledger.reserve_hardware(RunId::new(), None).is_ok());
    }

    #[test]
    fn pending_reservation_blocks_until_dropped() {
        let f = fixture();
        let slot = f.ledger.reserve_hardware(RunId::new(), None).unwrap();
        assert!(f.ledger.reserve_hardware(RunId::new(), None).is_err());
        drop(slot);
        assert!(f.ledger.reserve_hardware(RunId::new(), None).is_ok());
    }

    #[test]
    fn simulated_runs_never_block_the_screen() {
        let f = fixture();
        f.ledger.create(new_run(&f, RunPrivilege::Simulate)).unwrap();
        assert_eq!(f.ledger.hardware_holder(), None);
        assert!(f.ledger.reserve_hardware(RunId::new(), None).is_ok());
    }

    #[test]
    fn holder_is_the_reservation_then_the_open_entry() {
        let f = fixture();
        assert_eq!(f.ledger.hardware_holder(), None);

        let run = RunId::new();
        let slot = f.ledger.reserve_hardware(run, None).unwrap();
        assert_eq!(f.ledger.hardware_holder(), Some(HardwareHolder { run, job: None }));

        let mut new = new_run(&f, RunPrivilege::Hardware);
        new.id = Some(run);
        let job = new.job;
        f.ledger.create(new).unwrap();
        drop(slot);
        assert_eq!(f.ledger.hardware_holder(), Some(HardwareHolder { run, job }));

        f.ledger
            .complete(&run, Completion::bare(ExitReason::Natural))
            .unwrap();
        assert_eq!(f.ledger.hardware_holder(), None);
    }
}
