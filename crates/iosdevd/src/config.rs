//! Daemon configuration.
//!
//! Layering, lowest precedence first:
//! 1. Built-in defaults
//! 2. `$XDG_CONFIG_HOME/iosdev/config.toml` (or an explicit file)
//! 3. `IOSDEV_SOCKET` environment variable
//! 4. Command-line flags, applied by the binary
//!
//! ```toml
//! socket_path = "/run/iosdev.sock"
//! simulate = "/etc/iosdev/devices.toml"
//!
//! [watcher]
//! settle_window_ms = 500
//! settle_timeout_ms = 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Default socket path for the daemon
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/iosdev.sock";

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "IOSDEV_SOCKET";

const DEFAULT_SETTLE_WINDOW_MS: u64 = 500;
const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 2000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read {}: {error}", path.display())]
    Read { path: PathBuf, error: String },

    #[error("failed to parse {}: {error}", path.display())]
    Parse { path: PathBuf, error: String },
}

/// Timing of the watcher's startup settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Quiet period after the last notification before the watcher counts
    /// as settled.
    pub settle_window: Duration,
    /// Upper bound on how long `DeviceWatcher::start` blocks.
    pub settle_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_millis(DEFAULT_SETTLE_WINDOW_MS),
            settle_timeout: Duration::from_millis(DEFAULT_SETTLE_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Device description file for the simulated backend.
    pub simulate: Option<PathBuf>,
    pub watcher: WatcherConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            simulate: None,
            watcher: WatcherConfig::default(),
        }
    }
}

/// On-disk form. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    simulate: Option<PathBuf>,
    watcher: FileWatcherConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileWatcherConfig {
    settle_window_ms: Option<u64>,
    settle_timeout_ms: Option<u64>,
}

impl DaemonConfig {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("iosdev").join("config.toml"))
    }

    /// Loads defaults, the config file and the environment.
    ///
    /// A missing file at the default location is not an error; a missing
    /// explicit file is.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match explicit {
            Some(path) => config.apply_file(path)?,
            None => {
                if let Some(path) = Self::default_path().filter(|p| p.is_file()) {
                    config.apply_file(&path)?;
                }
            }
        }

        config.apply_env(std::env::var_os(SOCKET_ENV).map(PathBuf::from));
        Ok(config)
    }

    /// Merges a TOML file over the current values.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        self.apply_toml(path, &text)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(())
    }

    fn apply_toml(&mut self, path: &Path, text: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        if let Some(socket_path) = file.socket_path {
            self.socket_path = socket_path;
        }
        if let Some(simulate) = file.simulate {
            self.simulate = Some(simulate);
        }
        if let Some(ms) = file.watcher.settle_window_ms {
            self.watcher.settle_window = Duration::from_millis(ms);
        }
        if let Some(ms) = file.watcher.settle_timeout_ms {
            self.watcher.settle_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn apply_env(&mut self, socket: Option<PathBuf>) {
        if let Some(socket) = socket.filter(|p| !p.as_os_str().is_empty()) {
            self.socket_path = socket;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.watcher.settle_window, Duration::from_millis(500));
        assert_eq!(config.watcher.settle_timeout, Duration::from_secs(2));
        assert!(config.simulate.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "socket_path = \"/run/iosdev.sock\"\n[watcher]\nsettle_window_ms = 50"
        )
        .unwrap();

        let mut config = DaemonConfig::default();
        config.apply_file(file.path()).unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/iosdev.sock"));
        assert_eq!(config.watcher.settle_window, Duration::from_millis(50));
        assert_eq!(config.watcher.settle_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_env_beats_file() {
        let mut config = DaemonConfig::default();
        config
            .apply_toml(Path::new("inline"), "socket_path = \"/from/file\"")
            .unwrap();
        config.apply_env(Some(PathBuf::from("/from/env")));
        assert_eq!(config.socket_path, PathBuf::from("/from/env"));

        config.apply_env(Some(PathBuf::new()));
        assert_eq!(config.socket_path, PathBuf::from("/from/env"));
    }

    #[test]
    fn test_bad_files_are_reported() {
        let mut config = DaemonConfig::default();

        let err = config
            .apply_toml(Path::new("bad.toml"), "socket_path = 3")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));

        let err = config
            .apply_toml(Path::new("bad.toml"), "unknown = true")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = DaemonConfig::load(Some(Path::new("/nonexistent/iosdev.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
