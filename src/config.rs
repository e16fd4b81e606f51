use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for repomedic
///
/// Timeouts, retry counts, and backoff are deliberately configuration rather
/// than constants; the engine reads them all from here.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Base directory under which managed repositories live
    pub base_directory: String,

    /// Probe behavior (network and SSH checks)
    #[serde(default)]
    pub probes: ProbeConfig,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// SSH key and host settings
    #[serde(default)]
    pub ssh: SshConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Probe timeouts; two bounded steps per network probe keep latency predictable
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeConfig {
    /// Timeout per probe step (DNS resolution, TCP connect) in seconds
    #[serde(default = "default_probe_timeout")]
    pub step_timeout: u64,

    /// Timeout for the SSH handshake probe in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

/// Retry policy for transient probe states
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    /// Maximum sync attempts per repository
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff in seconds; each retry multiplies by the factor
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,

    /// Backoff multiplier (1s, 3s, 9s with the defaults)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
}

/// SSH configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SshConfig {
    /// Private key used for git-over-SSH
    #[serde(default = "default_ssh_key")]
    pub key_path: String,

    /// Git host to validate connectivity against
    #[serde(default = "default_ssh_host")]
    pub host: String,

    /// SSH port used by the network probe
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum parallel repository syncs
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for a single git operation in seconds
    #[serde(default = "default_git_timeout")]
    pub git_timeout: u64,

    /// Remove partially-cloned trees after a failed clone
    #[serde(default = "default_true")]
    pub cleanup_on_error: bool,

    /// Allow destructive repair (re-clone) without the CLI --force flag
    #[serde(default)]
    pub confirm_destructive: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_probe_timeout() -> u64 {
    5
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    1
}
fn default_backoff_factor() -> u32 {
    3
}
fn default_ssh_key() -> String {
    "${HOME}/.ssh/id_ed25519".to_string()
}
fn default_ssh_host() -> String {
    "github.com".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_max_parallel() -> usize {
    4
}
fn default_git_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_probe_timeout(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: default_ssh_key(),
            host: default_ssh_host(),
            port: default_ssh_port(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            git_timeout: default_git_timeout(),
            cleanup_on_error: default_true(),
            confirm_destructive: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_true(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_directory: "${HOME}/dev".to_string(),
            probes: ProbeConfig::default(),
            retry: RetryConfig::default(),
            ssh: SshConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // The file keeps the ${HOME} template form; the returned config
            // is expanded like a loaded one
            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repomedic").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.base_directory = shellexpand::full(&self.base_directory)
            .context("Failed to expand base_directory path")?
            .into_owned();

        self.ssh.key_path = shellexpand::full(&self.ssh.key_path)
            .context("Failed to expand ssh key_path")?
            .into_owned();

        Ok(())
    }

    /// Per-step probe timeout as a Duration
    pub fn probe_step_timeout(&self) -> Duration {
        Duration::from_secs(self.probes.step_timeout)
    }

    /// SSH handshake timeout as a Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.probes.handshake_timeout)
    }

    /// Timeout for a single git invocation
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.git_timeout)
    }

    /// Backoff delay after the given failed attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .retry
            .backoff_factor
            .saturating_pow(attempt.saturating_sub(1));
        Duration::from_secs(self.retry.backoff_base.saturating_mul(factor as u64))
    }
}
