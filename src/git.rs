//! Git-executable collaborator
//!
//! The engine never links a git library; every primitive operation shells out
//! to the `git` binary. The `GitExecutor` trait is the seam front-ends and
//! tests mock; `GitCli` is the production implementation.

use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Snapshot of a working tree as reported by git, without touching the network
#[derive(Debug, Clone, Default)]
pub struct WorkTreeStatus {
    pub dirty: bool,
    /// Commits on HEAD not on the upstream
    pub ahead: u32,
    /// Commits on the upstream not on HEAD
    pub behind: u32,
    pub remote_url: Option<String>,
}

/// Result of a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Fast-forwarded; approximate commit count from the pull output
    Updated { commits: u32 },
    AlreadyUpToDate,
}

/// Primitive git operations consumed by the sync engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// `git clone <remote> <path>`
    async fn clone_repo(&self, remote: &str, path: &Path) -> Result<()>;

    /// `git pull --ff-only origin`
    async fn pull(&self, path: &Path) -> Result<PullOutcome>;

    /// Local-only status inspection: porcelain status, ahead/behind counts,
    /// configured origin URL. Performs no fetch.
    async fn status(&self, path: &Path) -> Result<WorkTreeStatus>;

    /// `git remote set-url origin <remote>`
    async fn set_remote(&self, path: &Path, remote: &str) -> Result<()>;

    /// Remove a working tree entirely (used by destructive re-clone)
    async fn remove_tree(&self, path: &Path) -> Result<()>;
}

/// Production executor shelling out to the `git` binary
#[derive(Debug, Clone)]
pub struct GitCli {
    operation_timeout: Duration,
}

impl GitCli {
    pub fn new(operation_timeout: Duration) -> Self {
        Self { operation_timeout }
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<Output> {
        let mut cmd = AsyncCommand::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!("Running: git {}", args.join(" "));

        let output = timeout(self.operation_timeout, cmd.output())
            .await
            .map_err(|_| {
                EngineError::Network(format!(
                    "git {} timed out after {}s",
                    args.first().unwrap_or(&""),
                    self.operation_timeout.as_secs()
                ))
            })?
            .map_err(|e| EngineError::io(cwd.unwrap_or_else(|| Path::new(".")), e))?;

        Ok(output)
    }

    /// Run and require a zero exit code
    async fn run_checked(&self, args: &[&str], cwd: Option<&Path>) -> Result<Output> {
        let output = self.run(args, cwd).await?;

        if !output.status.success() {
            return Err(EngineError::Process {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }

    /// rev-list commit count; 0 when the range cannot be resolved (no
    /// upstream yet, empty history)
    async fn rev_list_count(&self, path: &Path, range: &str) -> Result<u32> {
        let output = self.run(&["rev-list", "--count", range], Some(path)).await?;

        if output.status.success() {
            let count_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(count_str.parse().unwrap_or(0))
        } else {
            Ok(0)
        }
    }

    fn parse_pull_output(stdout: &str) -> PullOutcome {
        if stdout.contains("Already up to date") || stdout.contains("Already up-to-date") {
            PullOutcome::AlreadyUpToDate
        } else {
            // "Updating abc123..def456": the count is not in the output, report 1+
            PullOutcome::Updated { commits: 1 }
        }
    }
}

#[async_trait]
impl GitExecutor for GitCli {
    async fn clone_repo(&self, remote: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(parent, e))?;
        }

        let path_str = path.to_string_lossy();
        self.run_checked(&["clone", remote, path_str.as_ref()], None)
            .await?;

        info!("Cloned {} -> {}", remote, path.display());
        Ok(())
    }

    async fn pull(&self, path: &Path) -> Result<PullOutcome> {
        let output = self
            .run_checked(&["pull", "--ff-only", "origin"], Some(path))
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcome = Self::parse_pull_output(&stdout);
        debug!("Pull at {}: {:?}", path.display(), outcome);
        Ok(outcome)
    }

    async fn status(&self, path: &Path) -> Result<WorkTreeStatus> {
        let porcelain = self
            .run_checked(&["status", "--porcelain"], Some(path))
            .await?;
        let dirty = !porcelain.stdout.is_empty();

        let ahead = self.rev_list_count(path, "@{upstream}..HEAD").await?;
        let behind = self.rev_list_count(path, "HEAD..@{upstream}").await?;

        let remote_output = self
            .run(&["remote", "get-url", "origin"], Some(path))
            .await?;
        let remote_url = if remote_output.status.success() {
            Some(
                String::from_utf8_lossy(&remote_output.stdout)
                    .trim()
                    .to_string(),
            )
        } else {
            None
        };

        Ok(WorkTreeStatus {
            dirty,
            ahead,
            behind,
            remote_url,
        })
    }

    async fn set_remote(&self, path: &Path, remote: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", "origin", remote], Some(path))
            .await?;

        info!("Re-pointed origin at {} for {}", remote, path.display());
        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| EngineError::io(path, e))?;
        }
        Ok(())
    }
}

/// True when the two URLs refer to the same repository, regardless of
/// https/ssh form or a trailing `.git`
pub fn remote_urls_match(actual: &str, expected: &str) -> bool {
    fn normalize(url: &str) -> String {
        let url = url.trim();
        let url = if let Some(rest) = url.strip_prefix("git@") {
            // git@host:owner/repo -> host/owner/repo
            rest.replacen(':', "/", 1)
        } else if let Some(rest) = url.strip_prefix("ssh://git@") {
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("https://") {
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("http://") {
            rest.to_string()
        } else {
            url.to_string()
        };
        url.trim_end_matches('/')
            .trim_end_matches(".git")
            .to_lowercase()
    }

    normalize(actual) == normalize(expected)
}
