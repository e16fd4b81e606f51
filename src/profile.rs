//! Repository and user profiles plus their on-disk store
//!
//! Profiles associate by id rather than containment: a `RepositoryProfile`
//! carries an optional owning user id, and both collections persist
//! independently in one YAML document under the XDG config directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Current health of a managed repository
///
/// Exactly one status is current per profile at any time; it is derived from
/// the latest probe snapshot and never hand-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Local path absent
    Missing,
    /// Path exists but is not a git working tree
    NotARepo,
    /// origin URL differs from the profile's remote
    RemoteMismatch,
    /// Uncommitted local changes
    Dirty,
    /// Local and remote histories conflict without fast-forward
    Diverged,
    SshInvalid,
    NetworkUnreachable,
    AuthInvalid,
    /// A probe failed transiently; nothing definitive known
    Unknown,
}

impl HealthStatus {
    /// Human-readable reason, used in report-only sync results
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Healthy => "repository is healthy",
            Self::Missing => "local path does not exist",
            Self::NotARepo => "path exists but is not a git repository",
            Self::RemoteMismatch => "origin remote does not match the configured URL",
            Self::Dirty => "working tree has uncommitted changes",
            Self::Diverged => "local and remote histories have diverged",
            Self::SshInvalid => "ssh configuration is invalid",
            Self::NetworkUnreachable => "git host is unreachable",
            Self::AuthInvalid => "github token is invalid or expired",
            Self::Unknown => "health could not be determined",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::Missing => "missing",
            Self::NotARepo => "not-a-repo",
            Self::RemoteMismatch => "remote-mismatch",
            Self::Dirty => "dirty",
            Self::Diverged => "diverged",
            Self::SshInvalid => "ssh-invalid",
            Self::NetworkUnreachable => "network-unreachable",
            Self::AuthInvalid => "auth-invalid",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// A locally-managed clone of a remote repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryProfile {
    pub id: Uuid,
    /// Display name, usually the repository name
    pub name: String,
    pub local_path: PathBuf,
    /// SSH-form remote URL (git@host:owner/name.git)
    pub remote_url: String,
    /// Weak reference to the owning user; resolved by lookup, never owned
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Default branch as reported by GitHub at add time
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Last push seen on GitHub at add time
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default = "default_health")]
    pub health: HealthStatus,
}

fn default_health() -> HealthStatus {
    HealthStatus::Unknown
}

impl RepositoryProfile {
    pub fn new(name: impl Into<String>, local_path: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            local_path: local_path.into(),
            remote_url: remote_url.into(),
            user_id: None,
            default_branch: None,
            pushed_at: None,
            last_sync: None,
            health: HealthStatus::Unknown,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// GitHub identity: username, opaque token, and the SSH key used for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    /// Opaque secret; never logged
    #[serde(default)]
    pub token: Option<String>,
    pub ssh_key_path: PathBuf,
}

impl UserProfile {
    pub fn new(username: impl Into<String>, ssh_key_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            token: None,
            ssh_key_path: ssh_key_path.into(),
        }
    }
}

/// Everything the store persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profiles {
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub repositories: Vec<RepositoryProfile>,
}

impl Profiles {
    pub fn repository(&self, id: Uuid) -> Option<&RepositoryProfile> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn repository_by_name(&self, name: &str) -> Option<&RepositoryProfile> {
        self.repositories.iter().find(|r| r.name == name)
    }

    pub fn user(&self, id: Uuid) -> Option<&UserProfile> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_by_name(&self, username: &str) -> Option<&UserProfile> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Replace the stored copy of a repository profile (matched by id)
    pub fn upsert_repository(&mut self, profile: RepositoryProfile) {
        match self.repositories.iter_mut().find(|r| r.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.repositories.push(profile),
        }
    }

    /// Remove a repository profile; local files are untouched
    pub fn remove_repository(&mut self, id: Uuid) -> Option<RepositoryProfile> {
        let idx = self.repositories.iter().position(|r| r.id == id)?;
        Some(self.repositories.remove(idx))
    }
}

/// YAML-backed profile persistence
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store location next to the main config file (XDG compliant)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get user config directory")?;
        Ok(config_dir.join("repomedic").join("profiles.yml"))
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all profiles; a missing file is an empty store
    pub fn load(&self) -> Result<Profiles> {
        if !self.path.exists() {
            return Ok(Profiles::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read profile store: {:?}", self.path))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse profile store: {:?}", self.path))
    }

    pub fn save(&self, profiles: &Profiles) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create profile directory: {:?}", parent))?;
        }

        let content =
            serde_yaml::to_string(profiles).context("Failed to serialize profiles")?;

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write profile store: {:?}", self.path))?;

        Ok(())
    }

    /// Persist a single updated repository profile
    pub fn save_repository(&self, profile: &RepositoryProfile) -> Result<()> {
        let mut profiles = self.load()?;
        profiles.upsert_repository(profile.clone());
        self.save(&profiles)
    }
}
