//! Zip archives of job storage, written before a reset purges it.
//!
//! Each archive holds a `manifest.json` describing the job and the job's
//! stored files under a directory named after the job id.

use crate::error::{Error, Result};
use crate::job::Job;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MANIFEST_NAME: &str = "manifest.json";
const MANIFEST_FORMAT: u32 = 1;

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    format: u32,
    system_version: &'static str,
    job: String,
    owner: Option<&'a str>,
    created_at: DateTime<Utc>,
    archived_at: DateTime<Utc>,
    entrypoint: &'a str,
    interpreter: Option<String>,
    path_count: usize,
}

/// Zip the job's storage into `archive_dir`, which is created if needed.
///
/// Returns the archive's path, or `None` when the storage directory is
/// missing or empty and there is nothing to keep.
pub async fn archive_job(job: &Job, archive_dir: &Path) -> Result<Option<PathBuf>> {
    let job = job.clone();
    let archive_dir = archive_dir.to_path_buf();
    tokio::task::spawn_blocking(move || write_archive(&job, &archive_dir))
        .await
        .map_err(|join| Error::Io(io::Error::new(io::ErrorKind::Other, join)))?
}

fn write_archive(job: &Job, archive_dir: &Path) -> Result<Option<PathBuf>> {
    let short = job.short_id();
    if !job.storage_path.is_dir() {
        tracing::warn!(job = %short, path = %job.storage_path.display(), "skipping archive: storage directory is missing");
        return Ok(None);
    }
    let mut files = Vec::new();
    list_files(&job.storage_path, Path::new(""), &mut files)?;
    if files.is_empty() {
        tracing::debug!(job = %short, "no files to archive");
        return Ok(None);
    }

    fs::create_dir_all(archive_dir)?;
    let archived_at = Utc::now();
    let path = archive_dir.join(format!("{}-W{}.zip", archived_at.format("%y%j"), short));
    let manifest = Manifest {
        format: MANIFEST_FORMAT,
        system_version: env!("CARGO_PKG_VERSION"),
        job: job.id.to_string(),
        owner: job.owner.as_ref().map(|owner| owner.0.as_str()),
        created_at: job.created_at,
        archived_at,
        entrypoint: &job.entry_file_name,
        interpreter: job
            .interpreter_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        path_count: files.len(),
    };

    let mut writer = ZipWriter::new(File::create(&path)?);
    writer.start_file(MANIFEST_NAME, deflated())?;
    writer.write_all(&serde_json::to_vec(&manifest).map_err(io::Error::from)?)?;
    let top = PathBuf::from(job.id.to_string());
    for relative in &files {
        let name = top.join(relative).to_string_lossy().into_owned();
        writer.start_file(name, deflated())?;
        io::copy(&mut File::open(job.storage_path.join(relative))?, &mut writer)?;
    }
    writer.finish()?;
    tracing::debug!(job = %short, files = files.len(), path = %path.display(), "archived job storage");
    Ok(Some(path))
}

fn deflated() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Regular files under `dir`, relative to the storage root. Symlinks are
/// left out, as they are when staging.
fn list_files(dir: &Path, prefix: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let kind = entry.file_type()?;
        let relative = prefix.join(entry.file_name());
        if kind.is_dir() {
            list_files(&entry.path(), &relative, files)?;
        } else if kind.is_file() {
            files.push(relative);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::types::{JobId, OwnerRef, RunPrivilege};
    use std::io::Read;
    use tempfile::TempDir;

    fn job(root: &Path) -> Job {
        let id = JobId::new();
        Job {
            id,
            created_at: Utc::now(),
            env_path: root.join("envs").join(id.to_string()),
            storage_path: root.join("storage").join(id.to_string()),
            run_dir: root.join("run").join(id.to_string()),
            interpreter_path: root.join("envs").join(id.to_string()).join("bin/python3"),
            entry_file_name: "main.py".into(),
            run_privilege: RunPrivilege::Simulate,
            max_runtime_secs: None,
            run_target: None,
            status: JobStatus::Idle,
            owner: Some(OwnerRef("ABCD1234".into())),
        }
    }

    #[tokio::test]
    async fn storage_is_zipped_with_a_manifest() {
        let root = TempDir::new().unwrap();
        let job = job(root.path());
        fs::create_dir_all(job.storage_path.join("assets")).unwrap();
        fs::write(job.entry_path(), "print('hi')\n").unwrap();
        fs::write(job.storage_path.join("assets/font.txt"), "abc").unwrap();

        let path = archive_job(&job, &root.path().join("archive"))
            .await
            .unwrap()
            .expect("archive written");
        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();

        let mut text = String::new();
        archive.by_name(MANIFEST_NAME).unwrap().read_to_string(&mut text).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(manifest["format"], 1);
        assert_eq!(manifest["job"], job.id.to_string());
        assert_eq!(manifest["owner"], "ABCD1234");
        assert_eq!(manifest["entrypoint"], "main.py");
        assert_eq!(manifest["interpreter"], "python3");
        assert_eq!(manifest["path_count"], 2);
        assert!(manifest["archived_at"].is_string());

        let mut code = String::new();
        archive
            .by_name(&format!("{}/main.py", job.id))
            .unwrap()
            .read_to_string(&mut code)
            .unwrap();
        assert_eq!(code, "print('hi')\n");
        assert!(archive.by_name(&format!("{}/assets/font.txt", job.id)).is_ok());
    }

    #[tokio::test]
    async fn nothing_to_keep_writes_no_archive() {
        let root = TempDir::new().unwrap();
        let archive_dir = root.path().join("archive");
        let job = job(root.path());
        assert_eq!(archive_job(&job, &archive_dir).await.unwrap(), None);

        fs::create_dir_all(&job.storage_path).unwrap();
        assert_eq!(archive_job(&job, &archive_dir).await.unwrap(), None);
        assert!(!archive_dir.exists());
    }
}
