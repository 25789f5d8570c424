//! Daemon configuration.
//!
//! Stored as TOML. The path is the first command-line argument, else
//! `TARDIS_TRANSFER_CONFIG`, else `~/.config/tardis-transfer/transferd.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tardis_model::{Location, RemoteHost};

/// Certificate-signing service endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    pub sign_url: String,
    #[serde(default)]
    pub authorize_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Bound on every HEAD/GET/PUT and session open.
    #[serde(default = "default_interval_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default = "default_credential_store")]
    pub credential_store: PathBuf,

    #[serde(default = "default_job_store")]
    pub job_store: PathBuf,

    /// Directory polled for push, status and verification requests.
    #[serde(default = "default_request_dir")]
    pub request_dir: PathBuf,

    #[serde(default = "default_request_poll_secs")]
    pub request_poll_secs: u64,

    /// JSON export of datasets, files and replicas.
    #[serde(default)]
    pub catalog: Option<PathBuf>,

    #[serde(default)]
    pub signing: Option<SigningConfig>,

    #[serde(default)]
    pub locations: Vec<Location>,

    /// Hosts merged into the credential store at start-up.
    #[serde(default)]
    pub hosts: Vec<RemoteHost>,
}

fn default_workers() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    60
}

fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".local/share/tardis-transfer")
}

fn default_credential_store() -> PathBuf {
    data_dir().join("credentials.json")
}

fn default_job_store() -> PathBuf {
    data_dir().join("jobs.json")
}

fn default_request_dir() -> PathBuf {
    data_dir().join("requests")
}

fn default_request_poll_secs() -> u64 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sweep_interval_secs: default_interval_secs(),
            operation_timeout_secs: default_interval_secs(),
            credential_store: default_credential_store(),
            job_store: default_job_store(),
            request_dir: default_request_dir(),
            request_poll_secs: default_request_poll_secs(),
            catalog: None,
            signing: None,
            locations: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration, falling back to defaults when the file
    /// does not exist.
    pub fn load(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = explicit.map_or_else(config_path, Ok)?;
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), locations = config.locations.len(), "configuration read");
        Ok(config)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn request_poll_interval(&self) -> Duration {
        Duration::from_secs(self.request_poll_secs.max(1))
    }
}

fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("TARDIS_TRANSFER_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("tardis-transfer")
        .join("transferd.toml"))
}
