//! Local repository inspection
//!
//! Read-only: the inspector looks at the filesystem and git metadata, never
//! the network. The result classifies a path into the states the planner
//! reasons about.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::git::{remote_urls_match, GitExecutor};

/// Classification of a local path relative to its expected remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalState {
    /// Path does not exist
    Absent,
    /// Path exists but holds no git working tree
    NotRepo,
    /// Working tree whose origin differs from the expected remote
    WrongRemote { found: Option<String> },
    /// Uncommitted changes present
    Dirty,
    /// Local and remote histories differ; fast-forwardable iff ahead == 0
    Diverged { ahead: u32, behind: u32 },
    /// Clean and current
    Clean,
}

impl LocalState {
    /// True when no remote interaction can change the outcome; the planner
    /// will report without probing the network
    pub fn is_locally_terminal(&self) -> bool {
        matches!(self, Self::Dirty)
    }
}

pub struct RepoInspector {
    git: Arc<dyn GitExecutor>,
}

impl RepoInspector {
    pub fn new(git: Arc<dyn GitExecutor>) -> Self {
        Self { git }
    }

    /// Inspect `path` against the profile's expected remote URL.
    ///
    /// A path that exists but cannot be read surfaces as an `Io` error,
    /// distinct from `Absent`, which means a clean clone target.
    pub async fn inspect(&self, path: &Path, expected_remote: &str) -> Result<LocalState> {
        if path.as_os_str().is_empty() {
            return Err(EngineError::Config("repository path is empty".to_string()));
        }

        match tokio::fs::metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Path absent: {}", path.display());
                return Ok(LocalState::Absent);
            }
            Err(e) => return Err(EngineError::io(path, e)),
        }

        let git_dir = path.join(".git");
        match tokio::fs::metadata(&git_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) | Err(_) => {
                debug!("Not a git repository: {}", path.display());
                return Ok(LocalState::NotRepo);
            }
        }

        let status = self.git.status(path).await?;

        match &status.remote_url {
            Some(actual) if remote_urls_match(actual, expected_remote) => {}
            found => {
                debug!(
                    "Remote mismatch at {}: expected {}, found {:?}",
                    path.display(),
                    expected_remote,
                    found
                );
                return Ok(LocalState::WrongRemote {
                    found: found.clone(),
                });
            }
        }

        if status.dirty {
            return Ok(LocalState::Dirty);
        }

        if status.ahead > 0 || status.behind > 0 {
            return Ok(LocalState::Diverged {
                ahead: status.ahead,
                behind: status.behind,
            });
        }

        Ok(LocalState::Clean)
    }
}

/// Compute the working-tree path for a repository under the base directory
pub fn repo_path(base_directory: &str, name: &str) -> PathBuf {
    Path::new(base_directory).join(name)
}
