//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`ROLLCALL_ROOT_FOLDER`, then `ROLLCALL_ROOT`)
//! 3. TOML config file (`<config_dir>/rollcall/<module>.toml`)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or malformed TOML file never aborts startup. The resolver logs a
//! warning and falls through to the next tier.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Primary environment variable for the root folder
pub const ENV_ROOT_FOLDER: &str = "ROLLCALL_ROOT_FOLDER";
/// Alternative (shorter) environment variable for the root folder
pub const ENV_ROOT: &str = "ROLLCALL_ROOT";
/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "rollcall.db";

/// Compiled defaults used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    /// Defaults for the platform this binary was compiled for
    pub fn for_current_platform() -> Self {
        let root_folder = if cfg!(target_os = "linux") {
            dirs::data_local_dir()
                .map(|d| d.join("rollcall"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/rollcall"))
        } else if cfg!(target_os = "macos") {
            dirs::data_dir()
                .map(|d| d.join("rollcall"))
                .unwrap_or_else(|| PathBuf::from("/Library/Application Support/rollcall"))
        } else if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .map(|d| d.join("rollcall"))
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\rollcall"))
        } else {
            PathBuf::from("./rollcall_data")
        };

        Self {
            root_folder,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by RUST_LOG)
    pub level: String,
    /// Optional log file path (stdout when absent)
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Proximity scanner settings (`[scanner]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Length of one discovery window in milliseconds
    pub window_ms: u64,
    /// RSSI at or above which a beacon counts as in proximity
    pub proximity_threshold: i16,
    /// Advertised name prefix that marks a teacher beacon
    pub name_prefix: String,
    /// Number of recent readings averaged for classification (1 = latest only)
    pub smoothing_window: usize,
    /// RSSI assumed when the radio reports none
    pub missing_rssi: i16,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            proximity_threshold: -70,
            name_prefix: "Teacher-".to_string(),
            smoothing_window: 1,
            missing_rssi: -100,
        }
    }
}

/// Biometric worker settings (`[worker]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker executable
    pub program: String,
    /// Arguments placed before `<mode> <sample_path> <subject_id>`
    pub args: Vec<String>,
    /// Hard deadline for one worker run
    pub timeout_ms: u64,
    /// Directory for transient sample artifacts (`<root>/staging` when absent)
    pub staging_dir: Option<PathBuf>,
    /// Longest accepted result line on stdout
    pub max_output_bytes: usize,
    /// Tail of stderr retained for diagnostics
    pub max_stderr_bytes: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["face_service_cli.py".to_string()],
            timeout_ms: 30_000,
            staging_dir: None,
            max_output_bytes: 64 * 1024,
            max_stderr_bytes: 16 * 1024,
        }
    }
}

/// HTTP server settings (`[server]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    /// Upper bound on request bodies (the base64 sample dominates)
    pub max_sample_bytes: usize,
    /// Total time spent retrying a locked ledger write
    pub ledger_lock_wait_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5740,
            max_sample_bytes: 10 * 1024 * 1024,
            ledger_lock_wait_ms: 5_000,
        }
    }
}

/// Contents of a module TOML file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub scanner: ScannerSettings,
    pub worker: WorkerSettings,
    pub server: ServerSettings,
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Serialize a config to disk, creating parent directories as needed
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Resolves the root folder for one module following the 4-tier priority
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
        }
    }

    /// Tier 1 override from the command line
    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    /// Path of this module's TOML file, if the platform has a config dir
    pub fn config_file_path(&self) -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rollcall").join(format!("{}.toml", self.module_name)))
    }

    /// Load the module TOML, falling back to defaults on any problem
    pub fn load_config(&self) -> TomlConfig {
        let Some(path) = self.config_file_path() else {
            return TomlConfig::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return TomlConfig::default();
        }
        match load_toml_config(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                TomlConfig::default()
            }
        }
    }

    pub fn resolve(&self) -> PathBuf {
        self.resolve_with(&self.load_config())
    }

    /// Resolve against an already-loaded config
    pub fn resolve_with(&self, config: &TomlConfig) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        for var in [ENV_ROOT_FOLDER, ENV_ROOT] {
            if let Ok(path) = std::env::var(var) {
                if !path.is_empty() {
                    return PathBuf::from(path);
                }
            }
        }

        if let Some(path) = &config.root_folder {
            return path.clone();
        }

        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Creates the root folder and derives paths inside it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Idempotent directory creation
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }

    /// Default staging directory for worker sample artifacts
    pub fn staging_path(&self) -> PathBuf {
        self.root_folder.join("staging")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_defaults_match_field_values() {
        let settings = ScannerSettings::default();
        assert_eq!(settings.window_ms, 10_000);
        assert_eq!(settings.proximity_threshold, -70);
        assert_eq!(settings.name_prefix, "Teacher-");
        assert_eq!(settings.smoothing_window, 1);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [scanner]
            proximity_threshold = -65

            [worker]
            program = "/opt/face/worker"
            "#,
        )
        .unwrap();

        assert_eq!(config.scanner.proximity_threshold, -65);
        assert_eq!(config.scanner.window_ms, 10_000);
        assert_eq!(config.worker.program, "/opt/face/worker");
        assert_eq!(config.worker.timeout_ms, 30_000);
        assert_eq!(config.server.port, 5740);
        assert!(config.root_folder.is_none());
    }

    #[test]
    fn test_cli_arg_wins() {
        let config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        let resolver =
            RootFolderResolver::new("test-module").with_cli_arg(Some(PathBuf::from("/from/cli")));
        assert_eq!(resolver.resolve_with(&config), PathBuf::from("/from/cli"));
    }
}
