//! Configuration management for privcount-control.
//!
//! Configuration is applied in order: defaults → TOML config file →
//! command-line arguments, with later sources overriding earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Start with sensible defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌────────────────────────┐
//!     │ Config file     │ ◄───│ privcount-control.toml │  (TOML format)
//!     │ exists?         │     │ or --config            │
//!     └────────┬────────┘     └────────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────────┐
//!     │ Apply CLI args  │ ◄───│ --loglevel, etc.    │
//!     │ (override)      │     └─────────────────────┘
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Validate        │
//!     └─────────────────┘
//! ```
//!
//! # Example Configuration File
//!
//! ```toml
//! loglevel = "notice"
//! # logfile = "/var/log/privcount-control.log"
//!
//! cookie_authentication = true
//! hashed_control_passwords = [
//!     "16:E6A9F4D2B3C1A0F98E60F1D2C3B4A5968778695A4B3C2D1E0F9F8E7D6C",
//! ]
//!
//! [registry]
//! max_auth_failures = 3
//! flush_threshold = 16
//!
//! [privcount]
//! enabled = true
//! exclude_directory_traffic = true
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Log level for privcount-control output and log-message events.
///
/// From most to least verbose: [`Debug`](LogLevel::Debug) >
/// [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error).
///
/// ```rust
/// use privcount_control::LogLevel;
///
/// let level = LogLevel::Notice;
/// assert!(level < LogLevel::Warn);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Session registry settings.
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `max_auth_failures` | 3 | Failed attempts before a session is dropped |
/// | `flush_threshold` | 16 | Queued lines that force an immediate flush |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Failed authentication attempts allowed before disconnecting.
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
    /// Per-session queue length that triggers a flush without waiting for
    /// the next tick.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

fn default_max_auth_failures() -> u32 {
    3
}
fn default_flush_threshold() -> usize {
    16
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_auth_failures: default_max_auth_failures(),
            flush_threshold: default_flush_threshold(),
        }
    }
}

/// PrivCount instrumentation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrivcountConfig {
    /// Emit PrivCount events at all.
    #[serde(default = "default_privcount_enabled")]
    pub enabled: bool,
    /// Leave directory-fetch-over-circuit traffic out of the exit-only
    /// end-of-life events.
    #[serde(default = "default_exclude_directory_traffic")]
    pub exclude_directory_traffic: bool,
}

fn default_privcount_enabled() -> bool {
    true
}
fn default_exclude_directory_traffic() -> bool {
    true
}

impl Default for PrivcountConfig {
    fn default() -> Self {
        Self {
            enabled: default_privcount_enabled(),
            exclude_directory_traffic: default_exclude_directory_traffic(),
        }
    }
}

/// Main configuration struct for privcount-control.
///
/// ```rust
/// use privcount_control::Config;
///
/// let config = Config::default();
/// assert!(config.cookie_authentication);
/// assert_eq!(config.registry.max_auth_failures, 3);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Salted password hashes accepted for authentication.
    #[serde(default)]
    pub hashed_control_passwords: Vec<String>,
    /// Accept cookie authentication.
    #[serde(default = "default_cookie_authentication")]
    pub cookie_authentication: bool,
    /// Session registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// PrivCount instrumentation settings.
    #[serde(default)]
    pub privcount: PrivcountConfig,
}

fn default_cookie_authentication() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: LogLevel::default(),
            logfile: None,
            hashed_control_passwords: Vec::new(),
            cookie_authentication: default_cookie_authentication(),
            registry: RegistryConfig::default(),
            privcount: PrivcountConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.registry.max_auth_failures == 0 {
            return Err(Error::Config(
                "max_auth_failures must be at least 1".to_string(),
            ));
        }
        if self.registry.flush_threshold == 0 {
            return Err(Error::Config(
                "flush_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line arguments for privcount-control.
///
/// # Environment Variables
///
/// - `PRIVCOUNT_CONTROL_CONFIG`: Path to configuration file (equivalent to `--config`)
#[derive(Parser, Debug)]
#[command(name = "privcount-control")]
#[command(about = "Control-channel event subsystem with PrivCount instrumentation")]
#[command(version)]
pub struct CliArgs {
    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "PRIVCOUNT_CONTROL_CONFIG",
        default_value = "privcount-control.toml"
    )]
    pub config_file: PathBuf,

    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Print the salted hash of a control password and exit.
    #[arg(long)]
    pub hash_password: Option<String>,

    /// Check a password against the configured hashed passwords and exit.
    #[arg(long)]
    pub verify_password: Option<String>,

    /// Failed authentication attempts allowed per session.
    #[arg(long)]
    pub max_auth_failures: Option<u32>,

    /// Per-session queue length that forces an immediate flush.
    #[arg(long)]
    pub flush_threshold: Option<usize>,

    /// Count directory-fetch-over-circuit traffic in exit-only events.
    #[arg(long)]
    pub include_directory_traffic: bool,

    /// Disable PrivCount events.
    #[arg(long)]
    pub disable_privcount: bool,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(max) = self.max_auth_failures {
            config.registry.max_auth_failures = max;
        }
        if let Some(threshold) = self.flush_threshold {
            config.registry.flush_threshold = threshold;
        }
        if self.include_directory_traffic {
            config.privcount.exclude_directory_traffic = false;
        }
        if self.disable_privcount {
            config.privcount.enabled = false;
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["privcount-control", "--config", "/nonexistent/privcount.toml"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.privcount.exclude_directory_traffic);
        assert_eq!(config.registry.flush_threshold, 16);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("ERR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.registry.max_auth_failures = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.registry.flush_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.hashed_control_passwords = vec!["16:00".to_string()];
        config.privcount.exclude_directory_traffic = false;
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "loglevel = \"debug\"\n[registry]\nflush_threshold = 4").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.loglevel, LogLevel::Debug);
        assert_eq!(config.registry.flush_threshold, 4);
        assert_eq!(config.registry.max_auth_failures, 3);
        assert!(config.privcount.enabled);
    }

    #[test]
    fn test_cli_overrides() {
        let args = args(&[
            "--loglevel",
            "INFO",
            "--max-auth-failures",
            "5",
            "--include-directory-traffic",
            "--disable-privcount",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.loglevel, LogLevel::Info);
        assert_eq!(config.registry.max_auth_failures, 5);
        assert!(!config.privcount.exclude_directory_traffic);
        assert!(!config.privcount.enabled);
    }

    #[test]
    fn test_cli_invalid_threshold_fails_validation() {
        let args = args(&["--flush-threshold", "0"]);
        assert!(matches!(load_config(&args), Err(Error::Config(_))));
    }
}
