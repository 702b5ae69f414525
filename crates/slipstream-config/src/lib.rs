//! # slipstream-config
//!
//! Configuration for the Slipstream layer and its daemon client.
//!
//! Loads configuration from:
//! 1. Built-in defaults
//! 2. `~/.slipstream/config.toml` (global)
//! 3. Environment variables (highest priority)
//!
//! The layer reads this once at initialization; nothing here is consulted
//! on the per-call fast path.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!(
            "[slipstream-config] WARNING: failed to load config: {}. Using defaults.",
            e
        );
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Environment switch that turns the whole layer into a pass-through.
pub const DISABLE_ENV: &str = "IPCD_DISABLE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub optimize: OptimizeConfig,
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            optimize: OptimizeConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Tunables of the optimization state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Bytes per direction before a pairing attempt is made. Also the
    /// length of the hashed stream prefix.
    pub threshold: u64,
    /// Total pairing attempts before giving up on an endpoint.
    pub max_sync_attempts: u32,
    /// Of those, how many retry immediately (yield only, no sleep).
    pub immediate_attempts: u32,
    /// Sleep between the remaining attempts, in milliseconds.
    pub retry_sleep_ms: u64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            threshold: 1 << 20,
            max_sync_attempts: 20,
            immediate_attempts: 3,
            retry_sleep_ms: 5,
        }
    }
}

/// Where the pairing daemon lives and how hard to try reaching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control socket the daemon listens on.
    pub socket_path: PathBuf,
    /// Binary to spawn when the daemon is not running.
    pub binary_path: PathBuf,
    /// Process name of the daemon itself; a process with this name never
    /// intercepts (the daemon must not optimize its own sockets).
    pub process_name: String,
    /// Connect-and-spawn attempts before the layer gives up fatally.
    pub spawn_attempts: u32,
    /// Backoff between spawn attempts, in milliseconds (multiplied by the
    /// attempt number).
    pub spawn_backoff_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/ipcd.sock"),
            binary_path: PathBuf::from("/usr/local/bin/ipcd"),
            process_name: "ipcd".to_string(),
            spawn_attempts: 5,
            spawn_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for per-pid layer logs.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/slipstream"),
        }
    }
}

impl Config {
    /// Load config from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::global_config_path() {
            Some(global_path) if global_path.exists() => {
                debug!("loading global config from {:?}", global_path);
                Self::load_file(&global_path)?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from an explicit file. Env overrides are not applied.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".slipstream/config.toml"))
    }

    /// Environment variables override file configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLIPSTREAM_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.optimize.threshold = n;
            }
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_SYNC_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.optimize.max_sync_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_DAEMON_SOCKET") {
            self.daemon.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_DAEMON_BIN") {
            self.daemon.binary_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_LOG_DIR") {
            self.logging.dir = PathBuf::from(v);
        }
    }
}

/// Should interception be disabled for this process?
///
/// True when `IPCD_DISABLE` is set (any value) or when the process is the
/// daemon itself.
pub fn interception_disabled() -> bool {
    if std::env::var_os(DISABLE_ENV).is_some() {
        return true;
    }
    let exe_name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()));
    match exe_name {
        Some(name) => process_is_daemon(&name.to_string_lossy(), &config().daemon.process_name),
        None => false,
    }
}

fn process_is_daemon(exe_name: &str, daemon_name: &str) -> bool {
    exe_name == daemon_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let c = Config::default();
        assert_eq!(c.optimize.threshold, 1 << 20);
        assert_eq!(c.optimize.max_sync_attempts, 20);
        assert_eq!(c.optimize.immediate_attempts, 3);
        assert_eq!(c.optimize.retry_sleep_ms, 5);
        assert_eq!(c.daemon.socket_path, PathBuf::from("/tmp/ipcd.sock"));
        assert_eq!(c.daemon.process_name, "ipcd");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c: Config = toml::from_str(
            r#"
            [optimize]
            threshold = 65536

            [daemon]
            socket_path = "/run/ipcd.sock"
            "#,
        )
        .unwrap();
        assert_eq!(c.optimize.threshold, 65536);
        assert_eq!(c.optimize.max_sync_attempts, 20);
        assert_eq!(c.daemon.socket_path, PathBuf::from("/run/ipcd.sock"));
        assert_eq!(c.daemon.process_name, "ipcd");
    }

    #[test]
    fn bad_toml_is_an_error_not_a_panic() {
        let r: Result<Config, _> = toml::from_str("optimize = 3");
        assert!(r.is_err());
    }

    #[test]
    fn daemon_self_detection_is_exact_match() {
        assert!(process_is_daemon("ipcd", "ipcd"));
        assert!(!process_is_daemon("ipcd2", "ipcd"));
        assert!(!process_is_daemon("myapp", "ipcd"));
    }

    #[test]
    fn load_file_reads_a_config_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [optimize]
            threshold = 4096
            retry_sleep_ms = 1

            [logging]
            dir = "/var/tmp/slipstream"
            "#,
        )
        .unwrap();

        let c = Config::load_file(&path).unwrap();
        assert_eq!(c.optimize.threshold, 4096);
        assert_eq!(c.optimize.retry_sleep_ms, 1);
        assert_eq!(c.logging.dir, PathBuf::from("/var/tmp/slipstream"));
        assert_eq!(c.daemon.socket_path, PathBuf::from("/tmp/ipcd.sock"));
    }

    #[test]
    fn load_file_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = Config::load_file(&dir.path().join("nope.toml"));
        assert!(matches!(r, Err(ConfigError::Io(_))));
    }

    #[test]
    fn roundtrips_through_toml() {
        let c = Config::default();
        let s = toml::to_string(&c).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.optimize.threshold, c.optimize.threshold);
        assert_eq!(back.daemon.socket_path, c.daemon.socket_path);
        assert_eq!(back.logging.dir, c.logging.dir);
    }
}
