//! Builds the isolated runtime each job runs in.
//!
//! Provisioning failures never fail job creation: they are logged, and a job
//! whose interpreter never materialized is refused at run time instead.

use crate::config::SandboxConfig;
use futures::future::{BoxFuture, FutureExt};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Packages every environment gets, before the client library.
pub const REQUIRED_PACKAGES: &[&str] = &["wheel"];

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {code:?}")]
    Failed { program: String, code: Option<i32> },
    #[error("{0} not found")]
    Missing(PathBuf),
    #[error("failed to install {0:?}")]
    Packages(Vec<String>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Provisioner: Send + Sync {
    /// Where the interpreter of an environment rooted at `env_dir` lives,
    /// whether or not it has been provisioned.
    fn interpreter_path(&self, env_dir: &Path) -> PathBuf;

    /// Materialize the environment. `label` names it in prompts and logs.
    fn provision<'a>(
        &'a self,
        env_dir: &'a Path,
        label: &'a str,
    ) -> BoxFuture<'a, Result<(), ProvisionError>>;
}

fn bin_dir(env_dir: &Path) -> PathBuf {
    env_dir.join("bin")
}

fn file_name_of(path: &Path) -> &OsStr {
    path.file_name().unwrap_or(path.as_os_str())
}

/// Creates a virtualenv per job and installs the fixed package set into it.
#[derive(Clone, Debug)]
pub struct VirtualenvProvisioner {
    interpreter: PathBuf,
    virtualenv: PathBuf,
    client_library: Option<PathBuf>,
    default_modules: Vec<String>,
    timeout: Duration,
}

impl VirtualenvProvisioner {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            virtualenv: config.virtualenv.clone(),
            client_library: config.client_library.clone(),
            default_modules: config.default_modules.clone(),
            timeout: config.provision_timeout(),
        }
    }

    async fn run_tool(&self, program: &Path, args: &[&OsStr]) -> Result<(), ProvisionError> {
        let name = program.display().to_string();
        tracing::debug!(program = %name, ?args, "running provisioning step");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                program: name.clone(),
                source,
            })?;
        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(ProvisionError::Timeout {
                    program: name,
                    timeout: self.timeout,
                });
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Failed {
                program: name,
                code: status.code(),
            })
        }
    }

    async fn pip_install(&self, pip: &Path, package: &OsStr) -> bool {
        match self.run_tool(pip, &[OsStr::new("install"), package]).await {
            Ok(()) => {
                tracing::debug!(?package, "installed package");
                true
            }
            Err(e) => {
                tracing::warn!(?package, error = %e, "failed to install package");
                false
            }
        }
    }

    async fn build(&self, env_dir: &Path, label: &str) -> Result<(), ProvisionError> {
        let prompt = format!("({}) ", label);
        self.run_tool(
            &self.virtualenv,
            &[
                OsStr::new("-p"),
                self.interpreter.as_os_str(),
                OsStr::new("--no-periodic-update"),
                OsStr::new("--no-vcs-ignore"),
                OsStr::new("--prompt"),
                OsStr::new(&prompt),
                env_dir.as_os_str(),
            ],
        )
        .await?;

        let pip = bin_dir(env_dir).join("pip");
        if !pip.exists() {
            return Err(ProvisionError::Missing(pip));
        }

        let mut failed = Vec::new();
        for package in REQUIRED_PACKAGES {
            if !self.pip_install(&pip, OsStr::new(package)).await {
                failed.push(package.to_string());
            }
        }
        match &self.client_library {
            Some(dist) if dist.exists() => {
                if !self.pip_install(&pip, dist.as_os_str()).await {
                    failed.push(dist.display().to_string());
                }
            }
            Some(dist) => {
                tracing::warn!(path = %dist.display(), "client library distribution not found");
                failed.push(dist.display().to_string());
            }
            None => tracing::warn!("no client library configured"),
        }
        for module in &self.default_modules {
            if !self.pip_install(&pip, OsStr::new(module)).await {
                failed.push(module.clone());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::Packages(failed))
        }
    }
}

impl Provisioner for VirtualenvProvisioner {
    fn interpreter_path(&self, env_dir: &Path) -> PathBuf {
        bin_dir(env_dir).join(file_name_of(&self.interpreter))
    }

    fn provision<'a>(
        &'a self,
        env_dir: &'a Path,
        label: &'a str,
    ) -> BoxFuture<'a, Result<(), ProvisionError>> {
        self.build(env_dir, label).boxed()
    }
}

/// Links an interpreter that already exists on the host into each
/// environment. For hosts without a Python toolchain, and for tests.
#[derive(Clone, Debug)]
pub struct SymlinkProvisioner {
    interpreter: PathBuf,
}

impl SymlinkProvisioner {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Provisioner for SymlinkProvisioner {
    fn interpreter_path(&self, env_dir: &Path) -> PathBuf {
        bin_dir(env_dir).join(file_name_of(&self.interpreter))
    }

    fn provision<'a>(
        &'a self,
        env_dir: &'a Path,
        _label: &'a str,
    ) -> BoxFuture<'a, Result<(), ProvisionError>> {
        async move {
            if !self.interpreter.exists() {
                return Err(ProvisionError::Missing(self.interpreter.clone()));
            }
            tokio::fs::create_dir_all(bin_dir(env_dir)).await?;
            let link = self.interpreter_path(env_dir);
            if tokio::fs::symlink_metadata(&link).await.is_err() {
                tokio::fs::symlink(&self.interpreter, &link).await?;
            }
            Ok(())
        }
        .boxed()
    }
}
