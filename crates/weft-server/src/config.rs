//! Server configuration, read from TOML.
//!
//! ```toml
//! backend = "worker"
//!
//! [worker]
//! command = "weft-worker"
//! timeout_ms = 30000
//!
//! [storage]
//! root = "/srv/weft"
//! namespace = "default"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft::fs::Filesystem;
use weft::StorageContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Embedded,
    Worker,
    Net,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Embedded => "embedded",
            Backend::Worker => "worker",
            Backend::Net => "net",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub net: NetSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

/// Detached worker process settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSettings {
    /// Worker executable, looked up on `PATH` when not absolute
    #[serde(default = "default_worker_command")]
    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// How long to wait for each response
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetSettings {
    /// Address the service listens on and clients connect to
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    /// Filesystem root; `$WEFT_FILESYSTEM_DIR` when unset
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_worker_command() -> PathBuf {
    PathBuf::from("weft-worker")
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_addr() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl WorkerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl NetSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: None,
            namespace: default_namespace(),
        }
    }
}

impl StorageSettings {
    /// Storage context for ops that touch the filesystem, if a root is known.
    pub fn context(&self) -> Option<StorageContext> {
        let fs = match &self.root {
            Some(root) => Filesystem::new(root),
            None => Filesystem::from_env()?,
        };
        Some(StorageContext::new(fs, self.namespace.as_str()))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ConfigError::Parse(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn embedded() -> Self {
        Self::default()
    }

    pub fn worker(command: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Worker,
            worker: WorkerSettings {
                command: command.into(),
                ..WorkerSettings::default()
            },
            ..Self::default()
        }
    }

    pub fn net(addr: impl Into<String>) -> Self {
        Self {
            backend: Backend::Net,
            net: NetSettings {
                addr: addr.into(),
                ..NetSettings::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_embedded() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.backend, Backend::Embedded);
        assert_eq!(config.worker.timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.namespace, "default");
    }

    #[test]
    fn sections_override_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            backend = "net"

            [net]
            addr = "0.0.0.0:9000"

            [worker]
            args = ["--quiet"]
            timeout_ms = 500

            [storage]
            root = "/srv/weft"
            namespace = "runs"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Net);
        assert_eq!(config.net.addr, "0.0.0.0:9000");
        assert_eq!(config.net.timeout_ms, 30_000);
        assert_eq!(config.worker.command, PathBuf::from("weft-worker"));
        assert_eq!(config.worker.args, ["--quiet"]);
        assert_eq!(config.worker.timeout(), Duration::from_millis(500));

        let storage = config.storage.context().unwrap();
        assert_eq!(storage.namespace(), "runs");
        assert_eq!(storage.root().root(), Path::new("/srv/weft"));
    }

    #[test]
    fn unknown_backends_and_fields_are_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str(r#"backend = "grpc""#),
            Err(ConfigError::Parse(_))
        ));
        assert!(ServerConfig::from_toml_str("[net]\nport = 1").is_err());
    }

    #[test]
    fn missing_files_report_their_path() {
        let err = ServerConfig::load(Path::new("/nonexistent/weft.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/weft.toml"));
    }
}
