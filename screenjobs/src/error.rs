use std::{io, result};
use thiserror;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Required directories or settings are missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A path a run depends on is gone, so the run cannot start.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// The request clashes with the current state (busy screen, busy job, closed run log).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no such {kind} exists: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("could not write archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("supervisor exited")]
    SupervisorGone,
}

impl Error {
    pub(crate) fn job_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "job",
            id: id.to_string(),
        }
    }

    pub(crate) fn run_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "run log",
            id: id.to_string(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
