//! TOML configuration for the relay daemon and CLI

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::sync::AllowList;

/// Full daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    #[serde(default)]
    pub decrypt: Option<DecryptConfig>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// Where files come from and how hard to try
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Regex matched at the start of each file name; absent means every file
    #[serde(default)]
    pub name_filter: Option<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RemoteConfig {
    pub fn compiled_filter(&self) -> Result<Option<Regex>> {
        self.name_filter.as_deref().map(compile_name_filter).transpose()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Transport backend, selected by `kind`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Http {
        url: String,
    },
    Sftp {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        user: Option<String>,
        #[serde(default = "default_sftp_root")]
        root: String,
        #[serde(default)]
        identity_file: Option<PathBuf>,
        #[serde(default)]
        password: Option<String>,
        /// Name of an environment variable holding the password
        #[serde(default)]
        password_env: Option<String>,
    },
    Local {
        path: PathBuf,
    },
}

impl TransportConfig {
    /// SFTP password, inline value first. `None` means key-based auth.
    pub fn sftp_password(&self) -> Result<Option<String>> {
        match self {
            TransportConfig::Sftp {
                password: Some(password),
                ..
            } => Ok(Some(password.clone())),
            TransportConfig::Sftp {
                password_env: Some(var),
                ..
            } => std::env::var(var).map(Some).map_err(|_| {
                RelayError::Config(format!("sftp password variable {} is not set", var))
            }),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub staging_dir: PathBuf,
    pub destination_dir: PathBuf,
    pub database: PathBuf,
    #[serde(default)]
    pub trigger_file: Option<PathBuf>,
    /// Skip forwarding while the destination root exists
    #[serde(default)]
    pub wait_for_destination: bool,
}

/// Decryption backend, selected by `kind`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DecryptConfig {
    Pgp(DecryptSettings),
    Sevenzip(DecryptSettings),
}

impl DecryptConfig {
    pub fn settings(&self) -> &DecryptSettings {
        match self {
            DecryptConfig::Pgp(settings) | DecryptConfig::Sevenzip(settings) => settings,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecryptSettings {
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Name of an environment variable holding the passphrase
    #[serde(default)]
    pub passphrase_env: Option<String>,
    /// Override for the external program
    #[serde(default)]
    pub command: Option<String>,
}

impl DecryptSettings {
    /// Inline passphrase wins over the environment
    pub fn resolve_passphrase(&self) -> Result<String> {
        if let Some(passphrase) = &self.passphrase {
            return Ok(passphrase.clone());
        }
        match &self.passphrase_env {
            Some(var) => std::env::var(var).map_err(|_| {
                RelayError::Config(format!("passphrase variable {} is not set", var))
            }),
            None => Err(RelayError::Config(
                "decrypt needs passphrase or passphrase_env".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionConfig {
    /// Days before a forwarded staged file is removed
    #[serde(default)]
    pub file_keep_days: Option<u64>,
    /// Days before a fully processed record is purged
    #[serde(default)]
    pub entry_keep_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub hours: AllowList,
    #[serde(default)]
    pub minutes: AllowList,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            hours: AllowList::default(),
            minutes: AllowList::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_retries() -> u32 {
    10
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_ssh_port() -> u16 {
    22
}

fn default_sftp_root() -> String {
    ".".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Compile a file name filter anchored at the start of the name, so
/// `report` matches `report.csv` but not `old_report.csv`
pub fn compile_name_filter(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})", pattern))
        .map_err(|e| RelayError::Config(format!("invalid name_filter: {}", e)))
}

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

impl RelayConfig {
    /// Load, expand and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse, expand and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: RelayConfig =
            toml::from_str(content).map_err(|e| RelayError::Config(e.to_string()))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        let local = &mut self.local;
        local.staging_dir = expand_path(&local.staging_dir);
        local.destination_dir = expand_path(&local.destination_dir);
        local.database = expand_path(&local.database);
        local.trigger_file = local.trigger_file.as_deref().map(expand_path);
        self.logging.file = self.logging.file.as_deref().map(expand_path);

        match &mut self.remote.transport {
            TransportConfig::Local { path } => *path = expand_path(path),
            TransportConfig::Sftp {
                identity_file: Some(identity),
                ..
            } => *identity = expand_path(identity),
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local.staging_dir == self.local.destination_dir {
            return Err(RelayError::Config(
                "staging_dir and destination_dir must differ".to_string(),
            ));
        }
        if self.remote.retries == 0 {
            return Err(RelayError::Config("retries must be at least 1".to_string()));
        }
        if self.schedule.interval_secs == 0 {
            return Err(RelayError::Config(
                "interval_secs must be at least 1".to_string(),
            ));
        }
        self.remote.compiled_filter()?;
        self.remote.transport.sftp_password()?;
        self.schedule.hours.validate(23, "hours")?;
        self.schedule.minutes.validate(59, "minutes")?;

        if let Some(decrypt) = &self.decrypt {
            decrypt.settings().resolve_passphrase()?;
        }

        if let (Some(file_keep), Some(entry_keep)) = (
            self.retention.file_keep_days,
            self.retention.entry_keep_days,
        ) {
            if entry_keep < file_keep {
                return Err(RelayError::Config(format!(
                    "entry_keep_days ({}) must not be shorter than file_keep_days ({})",
                    entry_keep, file_keep
                )));
            }
        }
        Ok(())
    }
}
