//! The persistence collaborator.
//!
//! Jobs and run log entries are stored by identifier. The one query that must
//! be answered atomically together with a write is the hardware reservation:
//! "is there an open hardware run, and if not, claim the screen".

use crate::error::{Error, Result};
use crate::job::Job;
use crate::ledger::RunLogEntry;
use crate::types::{JobId, RunId, RunPrivilege};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Whoever currently holds the shared screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareHolder {
    pub run: RunId,
    pub job: Option<JobId>,
}

pub trait Persistence: Send + Sync {
    /// Insert a new job. Hands the job back if its id is taken.
    fn insert_job(&self, job: Job) -> std::result::Result<(), Job>;
    fn job(&self, id: &JobId) -> Option<Job>;
    fn jobs(&self) -> Vec<Job>;
    /// Apply `update` to the stored job; nothing is written if it fails.
    fn update_job(&self, id: &JobId, update: &mut dyn FnMut(&mut Job) -> Result<()>)
        -> Result<Job>;
    /// Delete the job if `check` accepts it. `Ok(None)` when there is no
    /// such job.
    fn delete_job(
        &self,
        id: &JobId,
        check: &mut dyn FnMut(&Job) -> Result<()>,
    ) -> Result<Option<Job>>;

    /// Insert a new run log entry. Hands the entry back if its id is taken.
    ///
    /// Inserting the entry of the run that holds the hardware reservation
    /// converts the reservation into the open entry in the same step.
    fn insert_run_log(&self, entry: RunLogEntry) -> std::result::Result<(), RunLogEntry>;
    fn run_log(&self, id: &RunId) -> Option<RunLogEntry>;
    fn run_logs(&self) -> Vec<RunLogEntry>;
    /// Apply `update` to the stored entry; nothing is written if it fails.
    fn update_run_log(
        &self,
        id: &RunId,
        update: &mut dyn FnMut(&mut RunLogEntry) -> Result<()>,
    ) -> Result<RunLogEntry>;
    fn clear_run_logs(&self) -> usize;

    /// Claim the shared screen for `holder`, unless an open hardware run log
    /// or another reservation exists, in which case that holder is returned.
    fn reserve_hardware(&self, holder: HardwareHolder) -> std::result::Result<(), HardwareHolder>;
    /// Drop a reservation that never became a run log entry.
    fn release_hardware(&self, run: &RunId) -> bool;
    /// The open hardware run or pending reservation holding the screen.
    fn hardware_holder(&self) -> Option<HardwareHolder>;
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    run_logs: HashMap<RunId, RunLogEntry>,
    reservation: Option<HardwareHolder>,
}

impl Tables {
    fn hardware_holder(&self) -> Option<HardwareHolder> {
        self.run_logs
            .values()
            .find(|entry| entry.privilege == RunPrivilege::Hardware && entry.stopped_at.is_none())
            .map(|open| HardwareHolder {
                run: open.id,
                job: open.job,
            })
            .or(self.reservation)
    }
}

/// Persistence held in process memory behind one lock; every method is one
/// transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persistence for MemoryStore {
    fn insert_job(&self, job: Job) -> std::result::Result<(), Job> {
        let mut tables = self.lock();
        if tables.jobs.contains_key(&job.id) {
            return Err(job);
        }
        tables.jobs.insert(job.id, job);
        Ok(())
    }

    fn job(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    fn update_job(
        &self,
        id: &JobId,
        update: &mut dyn FnMut(&mut Job) -> Result<()>,
    ) -> Result<Job> {
        let mut tables = self.lock();
        let stored = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::job_not_found(id))?;
        let mut job = stored.clone();
        update(&mut job)?;
        *stored = job.clone();
        Ok(job)
    }

    fn delete_job(
        &self,
        id: &JobId,
        check: &mut dyn FnMut(&Job) -> Result<()>,
    ) -> Result<Option<Job>> {
        let mut tables = self.lock();
        match tables.jobs.get(id) {
            Some(job) => check(job)?,
            None => return Ok(None),
        }
        Ok(tables.jobs.remove(id))
    }

    fn insert_run_log(&self, entry: RunLogEntry) -> std::result::Result<(), RunLogEntry> {
        let mut tables = self.lock();
        if tables.run_logs.contains_key(&entry.id) {
            return Err(entry);
        }
        if tables.reservation.map(|holder| holder.run) == Some(entry.id) {
            tables.reservation = None;
        }
        tables.run_logs.insert(entry.id, entry);
        Ok(())
    }

    fn run_log(&self, id: &RunId) -> Option<RunLogEntry> {
        self.lock().run_logs.get(id).cloned()
    }

    fn run_logs(&self) -> Vec<RunLogEntry> {
        self.lock().run_logs.values().cloned().collect()
    }

    fn update_run_log(
        &self,
        id: &RunId,
        update: &mut dyn FnMut(&mut RunLogEntry) -> Result<()>,
    ) -> Result<RunLogEntry> {
        let mut tables = self.lock();
        let stored = tables
            .run_logs
            .get_mut(id)
            .ok_or_else(|| Error::run_not_found(id))?;
        let mut entry = stored.clone();
        update(&mut entry)?;
        *stored = entry.clone();
        Ok(entry)
    }

    fn clear_run_logs(&self) -> usize {
        let mut tables = self.lock();
        let count = tables.run_logs.len();
        tables.run_logs.clear();
        count
    }

    fn reserve_hardware(&self, holder: HardwareHolder) -> std::result::Result<(), HardwareHolder> {
        let mut tables = self.lock();
        if let Some(holder) = tables.hardware_holder() {
            return Err(holder);
        }
        tables.reservation = Some(holder);
        Ok(())
    }

    fn release_hardware(&self, run: &RunId) -> bool {
        let mut tables = self.lock();
        if tables.reservation.map(|holder| holder.run) == Some(*run) {
            tables.reservation = None;
            true
        } else {
            false
        }
    }

    fn hardware_holder(&self) -> Option<HardwareHolder> {
        self.lock().hardware_holder()
    }
}
