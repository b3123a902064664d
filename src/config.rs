//! Configuration - YAML file with defaults for every field
//!
//! ```yaml
//! scripts_dir: scripts
//! utils_dir: scripts/common
//! module_root: .
//! listen: 127.0.0.1:3001
//! sandbox:
//!   interpreter: node
//!   timeout_ms: 5000
//!   env_passthrough: [PATH, HOME, LANG, TZ]
//!   env: { API_BASE: https://example.test }
//!   allowed_builtins: ["*"]
//!   restrict_fs: false
//! broadcast:
//!   observer_capacity: 256
//! ```

use crate::core::{SandboxConfig, DEFAULT_OBSERVER_CAPACITY};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local config file probed first by `auto_load`
pub const LOCAL_CONFIG_FILE: &str = "easytask.yml";

const DEFAULT_LISTEN: &str = "127.0.0.1:3001";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduled task directory
    pub scripts_dir: PathBuf,
    /// Utility task directory; `<scripts_dir>/common` when unset
    pub utils_dir: Option<PathBuf>,
    /// Directory whose `node_modules` the sandbox may load packages from
    pub module_root: PathBuf,
    /// HTTP listen address; the `PORT` environment variable overrides the port
    pub listen: String,
    pub sandbox: SandboxSettings,
    pub broadcast: BroadcastSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub interpreter: String,
    pub timeout_ms: u64,
    pub env_passthrough: Vec<String>,
    pub env: HashMap<String, String>,
    pub allowed_builtins: Vec<String>,
    pub restrict_fs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Lines buffered per observer before new lines are dropped for it
    pub observer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
            utils_dir: None,
            module_root: PathBuf::from("."),
            listen: DEFAULT_LISTEN.to_string(),
            sandbox: SandboxSettings::default(),
            broadcast: BroadcastSettings::default(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let defaults = SandboxConfig::default();
        Self {
            interpreter: defaults.interpreter,
            timeout_ms: defaults.timeout.as_millis() as u64,
            env_passthrough: defaults.env_passthrough,
            env: defaults.env,
            allowed_builtins: defaults.allowed_builtins,
            restrict_fs: defaults.restrict_fs,
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
        }
    }
}

impl Config {
    /// Load config from a YAML file; relative paths resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(config.resolve_relative_to(base))
    }

    /// Auto-detect the config file
    /// Priority:
    /// 1. ./easytask.yml
    /// 2. <config dir>/easytask/config.yml
    /// 3. defaults
    pub fn auto_load() -> Result<Self> {
        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }

        if let Some(path) = Self::user_config_path() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Per-user config file location
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("easytask").join("config.yml"))
    }

    fn resolve_relative_to(mut self, base: &Path) -> Self {
        let join = |p: &Path| if p.is_relative() { base.join(p) } else { p.to_path_buf() };
        self.scripts_dir = join(&self.scripts_dir);
        self.utils_dir = self.utils_dir.as_deref().map(join);
        self.module_root = join(&self.module_root);
        self
    }

    pub fn utils_dir(&self) -> PathBuf {
        self.utils_dir
            .clone()
            .unwrap_or_else(|| self.scripts_dir.join("common"))
    }

    /// Listen address with the `PORT` override applied
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let mut addr: SocketAddr = self
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen))?;

        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid PORT '{}'", port))?;
            addr.set_port(port);
        }
        Ok(addr)
    }

    /// Sandbox settings in the form the runner consumes
    pub fn sandbox_config(&self) -> SandboxConfig {
        let utils_dir = self.utils_dir();
        let utils_mount = utils_dir
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("common"));

        SandboxConfig {
            interpreter: self.sandbox.interpreter.clone(),
            module_root: self.module_root.clone(),
            utils_dir,
            utils_mount,
            timeout: Duration::from_millis(self.sandbox.timeout_ms),
            env_passthrough: self.sandbox.env_passthrough.clone(),
            env: self.sandbox.env.clone(),
            allowed_builtins: self.sandbox.allowed_builtins.clone(),
            restrict_fs: self.sandbox.restrict_fs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.utils_dir(), PathBuf::from("scripts/common"));
        assert_eq!(config.sandbox.timeout_ms, 5000);
        assert_eq!(config.broadcast.observer_capacity, 256);

        let sandbox = config.sandbox_config();
        assert_eq!(sandbox.timeout, Duration::from_secs(5));
        assert_eq!(sandbox.utils_mount, PathBuf::from("common"));
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("easytask.yml");
        std::fs::write(
            &path,
            "scripts_dir: jobs\nutils_dir: /opt/shared/lib\nsandbox:\n  timeout_ms: 250\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.scripts_dir, dir.path().join("jobs"));
        assert_eq!(config.utils_dir(), PathBuf::from("/opt/shared/lib"));
        assert_eq!(config.module_root, dir.path().join("."));
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert_eq!(config.sandbox.interpreter, "node");
        assert_eq!(config.sandbox_config().utils_mount, PathBuf::from("lib"));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yml");
        std::fs::write(&path, "sandbox: [").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
