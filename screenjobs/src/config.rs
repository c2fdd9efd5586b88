//! Host configuration, read from a TOML file.
//!
//! Every field has a default so an empty file is a valid configuration.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub ipc: IpcConfig,
    pub screen: ScreenConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Root under which each job's environment directory is created.
    pub envs_dir: PathBuf,
    /// Root under which each job's source files are kept.
    pub storage_dir: PathBuf,
    /// Root under which each job's files are staged before a run.
    pub run_dir: PathBuf,
    /// File name of the program a job runs.
    pub entrypoint: String,
    /// Interpreter the environments are built from, and its file name inside them.
    pub interpreter: PathBuf,
    pub virtualenv: PathBuf,
    /// Distribution of the client control library installed into every environment.
    pub client_library: Option<PathBuf>,
    /// Packages installed after the fixed set.
    pub default_modules: Vec<String>,
    pub provision_timeout_secs: u64,
    pub run_uid: Option<u32>,
    pub run_gid: Option<u32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            envs_dir: PathBuf::from("/var/lib/screenjobs/envs"),
            storage_dir: PathBuf::from("/var/lib/screenjobs/storage"),
            run_dir: PathBuf::from("/var/lib/screenjobs/run"),
            entrypoint: "main.py".to_string(),
            interpreter: PathBuf::from("python3"),
            virtualenv: PathBuf::from("virtualenv"),
            client_library: None,
            default_modules: Vec::new(),
            provision_timeout_secs: 120,
            run_uid: None,
            run_gid: None,
        }
    }
}

impl SandboxConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    /// Address the relay binds, and the host handed to jobs.
    pub host: String,
    /// Upper bound on how long the relay waits before rechecking its stop flag.
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            poll_interval_ms: 100,
        }
    }
}

impl IpcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScreenConfig {
    pub width: u16,
    pub height: u16,
}

impl ScreenConfig {
    pub fn pixel_count(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 32,
            height: 8,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        let pixels = self.screen.pixel_count();
        if pixels > wire::MAX_PIXELS {
            return Err(Error::Configuration(format!(
                "a {}x{} screen has {} pixels; frames can address at most {}",
                self.screen.width,
                self.screen.height,
                pixels,
                wire::MAX_PIXELS
            )));
        }
        Ok(())
    }

    /// Config whose three sandbox roots live under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Config::default();
        config.sandbox.envs_dir = root.join("envs");
        config.sandbox.storage_dir = root.join("storage");
        config.sandbox.run_dir = root.join("run");
        config
    }
}
