//! TOML configuration for the Atlas daemon.
//!
//! When no config file is given, [`CliConfig::discover`] looks for
//! `atlas.toml` in the working directory and then in the user config
//! directory, falling back to built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// File name probed by [`CliConfig::discover`].
pub const CONFIG_FILE_NAME: &str = "atlas.toml";

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Data directory and listen addresses.
    pub node: NodeSection,
    /// Superuser credentials.
    pub auth: AuthSection,
    /// Commit log location and queue size.
    pub journal: JournalSection,
    /// Layer store and registry backend.
    pub storage: StorageSection,
    /// File import settings.
    pub import: ImportSection,
    /// Graceful shutdown tuning.
    pub shutdown: ShutdownSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (registry, layers, commit log).
    pub data_dir: PathBuf,
    /// Address for the HTTP API.
    pub http_listen_addr: String,
    /// Address for the command socket. Only loopback peers are served.
    pub socket_listen_addr: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".atlas"))
            .unwrap_or_else(|| PathBuf::from(".atlas"));
        Self {
            data_dir,
            http_listen_addr: "0.0.0.0:8080".to_string(),
            socket_listen_addr: "127.0.0.1:3333".to_string(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Key for `/management` routes.
    ///
    /// If empty, a random key is generated at startup and logged.
    pub superuser_key: String,
}

/// `[journal]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct JournalSection {
    /// Commit log file. Defaults to `<data_dir>/commit.log`.
    pub path: Option<PathBuf>,
    /// Entries buffered before new ones are dropped.
    pub capacity: usize,
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            path: None,
            capacity: atlas_journal::DEFAULT_CAPACITY,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend type: `"file"` (default) or `"memory"`.
    pub backend: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
        }
    }
}

/// `[import]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImportSection {
    /// Program used to turn shapefiles into GeoJSON.
    pub converter: String,
}

impl Default for ImportSection {
    fn default() -> Self {
        Self {
            converter: "ogr2ogr".to_string(),
        }
    }
}

/// `[shutdown]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    /// Upper bound for draining sessions and the commit log.
    pub timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or discover one if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::read(p),
            None => Self::discover(),
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Use the first `atlas.toml` found in the working directory or the
    /// user config directory, else defaults.
    pub fn discover() -> anyhow::Result<Self> {
        let candidates = [
            Some(PathBuf::from(CONFIG_FILE_NAME)),
            dirs::config_dir().map(|d| d.join("atlas").join(CONFIG_FILE_NAME)),
        ];
        for candidate in candidates.into_iter().flatten() {
            if candidate.is_file() {
                return Self::read(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Whether nothing is persisted except the commit log.
    pub fn memory_mode(&self) -> bool {
        self.storage.backend == "memory"
    }

    /// Effective commit log path.
    pub fn journal_path(&self) -> PathBuf {
        self.journal
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("commit.log"))
    }

    /// Ownership registry directory.
    pub fn meta_path(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }

    /// Layer store directory.
    pub fn layers_path(&self) -> PathBuf {
        self.node.data_dir.join("layers")
    }

    /// Effective shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }
}
