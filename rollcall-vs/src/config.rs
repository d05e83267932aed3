//! Service configuration for rollcall-vs
//!
//! Built from the module TOML (`rollcall-vs.toml`) plus command-line
//! overrides. Relative paths are taken relative to the root folder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rollcall_common::config::{ServerSettings, TomlConfig, WorkerSettings};
use rollcall_common::{Error, Result};

use crate::worker::WorkerConfig;

/// Command-line values that win over the TOML file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub worker_program: Option<String>,
}

/// Everything the service needs after resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub root_folder: PathBuf,
    pub server: ServerSettings,
    pub worker: WorkerConfig,
}

impl ServiceConfig {
    pub fn resolve(root_folder: &Path, toml: &TomlConfig, overrides: Overrides) -> Result<Self> {
        let mut server = toml.server.clone();
        if let Some(bind) = overrides.bind {
            server.bind = bind;
        }
        if let Some(port) = overrides.port {
            server.port = port;
        }

        let mut worker_settings = toml.worker.clone();
        if let Some(program) = overrides.worker_program {
            worker_settings.program = program;
        }

        let config = Self {
            root_folder: root_folder.to_path_buf(),
            server,
            worker: worker_config(root_folder, &worker_settings),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.program.trim().is_empty() {
            return Err(Error::Config("worker.program must not be empty".to_string()));
        }
        if self.worker.timeout.is_zero() {
            return Err(Error::Config("worker.timeout_ms must be positive".to_string()));
        }
        if self.worker.max_output_bytes == 0 {
            return Err(Error::Config("worker.max_output_bytes must be positive".to_string()));
        }
        if self.server.max_sample_bytes == 0 {
            return Err(Error::Config("server.max_sample_bytes must be positive".to_string()));
        }
        Ok(())
    }

    /// `bind:port` for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

fn worker_config(root_folder: &Path, settings: &WorkerSettings) -> WorkerConfig {
    let staging_dir = match &settings.staging_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => root_folder.join(dir),
        None => root_folder.join("staging"),
    };

    WorkerConfig {
        program: settings.program.clone(),
        args: settings.args.clone(),
        timeout: Duration::from_millis(settings.timeout_ms),
        staging_dir,
        max_output_bytes: settings.max_output_bytes,
        max_stderr_bytes: settings.max_stderr_bytes,
    }
}
