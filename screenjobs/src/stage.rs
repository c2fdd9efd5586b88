//! Copies a job's stored files into its run directory.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::Path;

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clean_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn copy_times(src: &fs::Metadata, dst: &Path) -> io::Result<()> {
    let times = FileTimes::new()
        .set_accessed(src.accessed()?)
        .set_modified(src.modified()?);
    File::open(dst)?.set_times(times)
}

/// Recursively copy the contents of `src` into `dst`, preserving permission
/// bits and access/modification times. Symlinks are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if kind.is_symlink() {
            tracing::debug!(path = %from.display(), "not staging symlink");
        } else if kind.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
            let meta = entry.metadata()?;
            fs::set_permissions(&to, meta.permissions())?;
            copy_times(&meta, &to)?;
        } else {
            // fs::copy carries the permission bits over
            fs::copy(&from, &to)?;
            copy_times(&entry.metadata()?, &to)?;
        }
    }
    Ok(())
}

/// Empty `run_dir` and fill it with the contents of `storage`.
///
/// On failure the run directory is emptied again before the error returns.
pub async fn stage(storage: &Path, run_dir: &Path) -> io::Result<()> {
    let storage = storage.to_path_buf();
    let run_dir = run_dir.to_path_buf();
    let staged = tokio::task::spawn_blocking(move || {
        clean_dir(&run_dir)?;
        if let Err(e) = copy_tree(&storage, &run_dir) {
            if let Err(clean) = clean_dir(&run_dir) {
                tracing::warn!(error = %clean, path = %run_dir.display(), "could not clean run directory");
            }
            return Err(e);
        }
        Ok(())
    })
    .await;
    match staged {
        Ok(result) => result,
        Err(join) => Err(io::Error::new(io::ErrorKind::Other, join)),
    }
}
