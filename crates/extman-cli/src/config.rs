//! Runtime settings resolved from CLI flags, an optional TOML file, and defaults.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//! request_timeout_ms = 30000   # 0 disables the deadline
//!
//! [extensions]
//! directory = "extensions"
//! bucketfs_base_path = "/buckets/bfsdefault/default/"
//!
//! [database]
//! directory = ".extman/databases"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use extman_controller::DEFAULT_BUCKETFS_BASE_PATH;
use extman_gateway::DEFAULT_BIND_ADDRESS;
use serde::{Deserialize, Serialize};

use crate::cli_args::Cli;

const DEFAULT_EXTENSIONS_DIR: &str = "extensions";
const DEFAULT_DATABASE_DIR: &str = ".extman/databases";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub extensions: ExtensionsSection,
    #[serde(default)]
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<SocketAddr>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionsSection {
    pub directory: Option<PathBuf>,
    pub bucketfs_base_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub directory: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub bind: SocketAddr,
    pub request_timeout: Option<Duration>,
    pub extensions_dir: PathBuf,
    pub bucketfs_base_path: String,
    pub database_dir: PathBuf,
}

impl RuntimeSettings {
    /// Loads the config file named by `cli` (if any) and resolves the settings.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let file = match cli.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Flags win over file values, file values win over defaults.
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let bind = match cli.bind.or(file.server.bind) {
            Some(bind) => bind,
            None => DEFAULT_BIND_ADDRESS
                .parse()
                .context("invalid default bind address")?,
        };
        let timeout_ms = cli
            .request_timeout_ms
            .or(file.server.request_timeout_ms)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        Ok(Self {
            bind,
            request_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            extensions_dir: cli
                .extensions_dir
                .clone()
                .or(file.extensions.directory)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTENSIONS_DIR)),
            bucketfs_base_path: cli
                .bucketfs_base_path
                .clone()
                .or(file.extensions.bucketfs_base_path)
                .unwrap_or_else(|| DEFAULT_BUCKETFS_BASE_PATH.to_string()),
            database_dir: cli
                .database_dir
                .clone()
                .or(file.database.directory)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_DIR)),
        })
    }
}
