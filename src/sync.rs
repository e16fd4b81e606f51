//! Sync engine: probe, plan, execute, verify
//!
//! One attempt takes a probe snapshot, asks the planner for an action,
//! executes it, and re-inspects to verify the outcome. Transient states retry
//! with exponential backoff up to the configured attempt cap. Every step
//! boundary checks the cancel flag, so a cancelled engine never starts a new
//! git operation (an in-flight one runs to completion).
//!
//! Two tasks never sync the same working tree concurrently: an in-process
//! per-path mutex serializes tasks within this engine, and an exclusive lock
//! file beside the tree keeps other processes out.

use futures::stream::{FuturesUnordered, StreamExt};
use fs2::FileExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::git::GitExecutor;
use crate::github::TokenValidator;
use crate::inspect::{LocalState, RepoInspector};
use crate::net::{ConnectivityProbe, NetState};
use crate::planner::{Action, ActionPlanner, ProbeSnapshot};
use crate::profile::{HealthStatus, RepositoryProfile};
use crate::ssh::SshCheck;

/// Cooperative cancellation handle shared between the engine and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-supplied knobs for a sync run
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Allow the engine to delete a broken tree and re-clone it
    pub confirm_destructive: bool,
}

/// One repository plus the credentials needed to sync it
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub profile: RepositoryProfile,
    /// GitHub token of the owning user, when one is configured
    pub token: Option<String>,
    /// SSH key override; falls back to the configured key
    pub key_path: Option<PathBuf>,
}

impl SyncJob {
    pub fn new(profile: RepositoryProfile) -> Self {
        Self {
            profile,
            token: None,
            key_path: None,
        }
    }
}

/// Outcome of syncing one repository
#[derive(Debug)]
pub struct SyncResult {
    /// Profile with health and last_sync updated; the caller persists it
    pub profile: RepositoryProfile,
    pub prior_health: HealthStatus,
    /// Last action the planner decided (None when probing itself failed)
    pub action: Option<Action>,
    pub attempts: u32,
    pub error: Option<String>,
    pub duration: Duration,
}

impl SyncResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate outcome of a batch run
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub results: Vec<SyncResult>,
}

impl SyncSummary {
    pub fn healthy(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.profile.health == HealthStatus::Healthy)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn all_ok(&self) -> bool {
        self.failed() == 0
    }
}

/// Holds the exclusive lock file for one working tree.
///
/// The file stays on disk after release: unlinking it would let a second
/// process lock a fresh file at the same path while a third still holds the
/// unlinked inode.
struct TreeLock {
    file: std::fs::File,
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct SyncEngine {
    config: Config,
    git: Arc<dyn GitExecutor>,
    net: Arc<dyn ConnectivityProbe>,
    ssh: Arc<dyn SshCheck>,
    auth: Arc<dyn TokenValidator>,
    inspector: RepoInspector,
    cancel: CancelFlag,
    /// In-process single-flight registry, keyed by working-tree path
    tree_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        config: Config,
        git: Arc<dyn GitExecutor>,
        net: Arc<dyn ConnectivityProbe>,
        ssh: Arc<dyn SshCheck>,
        auth: Arc<dyn TokenValidator>,
    ) -> Self {
        let inspector = RepoInspector::new(Arc::clone(&git));
        Self {
            config,
            git,
            net,
            ssh,
            auth,
            inspector,
            cancel: CancelFlag::new(),
            tree_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn key_path_for(&self, job: &SyncJob) -> PathBuf {
        job.key_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.config.ssh.key_path))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn in_process_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = self
            .tree_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            registry
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Take the cross-process lock file beside the working tree
    fn lock_tree(&self, tree: &Path) -> Result<TreeLock> {
        let name = tree
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tree".to_string());
        let parent = tree.parent().unwrap_or_else(|| Path::new("."));

        std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;

        let lock_path = parent.join(format!(".{}.sync.lock", name));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| EngineError::io(&lock_path, e))?;

        file.try_lock_exclusive().map_err(|_| EngineError::Busy {
            path: tree.to_path_buf(),
        })?;

        Ok(TreeLock { file })
    }

    /// Take one probe snapshot for a repository.
    ///
    /// A locally-terminal state (dirty tree) skips the remote probes entirely;
    /// the snapshot records them as skipped. When the host is unreachable the
    /// handshake and token probes are skipped too, since they could only
    /// time out.
    async fn probe(
        &self,
        profile: &RepositoryProfile,
        key_path: &Path,
        token: Option<&str>,
    ) -> Result<ProbeSnapshot> {
        let local = self
            .inspector
            .inspect(&profile.local_path, &profile.remote_url)
            .await?;

        let mut snapshot = ProbeSnapshot::new(local);
        if snapshot.local.is_locally_terminal() {
            debug!("{}: local state is terminal, skipping remote probes", profile.name);
            return Ok(snapshot);
        }

        let host = &self.config.ssh.host;
        let net = self.net.probe(host).await;
        snapshot.net = Some(net);

        if net == NetState::Reachable {
            snapshot.ssh = Some(self.ssh.validate(key_path, host).await);

            if let Some(token) = token {
                snapshot.auth = Some(self.auth.validate_token(token).await);
            }
        }

        Ok(snapshot)
    }

    /// Execute one planned action. Probe-only actions are no-ops here.
    async fn execute(
        &self,
        action: Action,
        profile: &RepositoryProfile,
        key_path: &Path,
        options: &SyncOptions,
    ) -> Result<()> {
        match action {
            Action::Clone => self.clone_with_cleanup(profile).await,
            Action::Pull => self.git.pull(&profile.local_path).await.map(|outcome| {
                debug!("{}: pull -> {:?}", profile.name, outcome);
            }),
            Action::ReinitRemote => {
                self.git
                    .set_remote(&profile.local_path, &profile.remote_url)
                    .await
            }
            Action::RegenerateSshConfig => self.ssh.regenerate(key_path, &self.config.ssh.host).await,
            Action::ReCloneFresh => {
                if !options.confirm_destructive {
                    return Err(EngineError::DestructiveActionDenied {
                        path: profile.local_path.clone(),
                    });
                }
                warn!(
                    "{}: removing {} for a fresh clone",
                    profile.name,
                    profile.local_path.display()
                );
                self.git.remove_tree(&profile.local_path).await?;
                self.clone_with_cleanup(profile).await
            }
            Action::ReportOnly | Action::RetryLater => Ok(()),
        }
    }

    async fn clone_with_cleanup(&self, profile: &RepositoryProfile) -> Result<()> {
        let result = self
            .git
            .clone_repo(&profile.remote_url, &profile.local_path)
            .await;

        if result.is_err() && self.config.sync.cleanup_on_error {
            // A partial clone would read as NotRepo on the next attempt
            if let Err(e) = self.git.remove_tree(&profile.local_path).await {
                warn!("{}: cleanup after failed clone failed: {}", profile.name, e);
            }
        }

        result
    }

    /// Re-inspect after a mutating action and derive the resulting health
    async fn verify(&self, profile: &RepositoryProfile) -> Result<HealthStatus> {
        let local = self
            .inspector
            .inspect(&profile.local_path, &profile.remote_url)
            .await?;
        Ok(HealthStatus::from_snapshot(&ProbeSnapshot::new(local)))
    }

    /// Probe once and report health without taking any action
    pub async fn check_health(&self, job: &SyncJob) -> Result<(HealthStatus, ProbeSnapshot)> {
        let key_path = self.key_path_for(job);
        let snapshot = self
            .probe(&job.profile, &key_path, job.token.as_deref())
            .await?;
        Ok((HealthStatus::from_snapshot(&snapshot), snapshot))
    }

    /// Sync a single repository to convergence or a terminal report.
    pub async fn sync_one(&self, job: SyncJob, options: &SyncOptions) -> SyncResult {
        let started = Instant::now();
        let prior_health = job.profile.health;
        let mut profile = job.profile.clone();
        let key_path = self.key_path_for(&job);
        let max_attempts = self.config.retry.max_attempts.max(1);

        // Serialize against other tasks in this process, then other processes
        let local_lock = self.in_process_lock(&profile.local_path);
        let _local_guard = local_lock.lock().await;

        let _tree_lock = match self.lock_tree(&profile.local_path) {
            Ok(lock) => lock,
            Err(e) => {
                return SyncResult {
                    profile,
                    prior_health,
                    action: None,
                    attempts: 0,
                    error: Some(e.to_string()),
                    duration: started.elapsed(),
                }
            }
        };

        let mut last_action = None;
        let mut error = None;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;

            if let Err(e) = self.check_cancelled() {
                error = Some(e.to_string());
                break;
            }

            let snapshot = match self.probe(&profile, &key_path, job.token.as_deref()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error = Some(e.to_string());
                    profile.health = HealthStatus::Unknown;
                    break;
                }
            };

            let action = ActionPlanner::decide_snapshot(&snapshot, attempt, max_attempts);
            last_action = Some(action);
            profile.health = HealthStatus::from_snapshot(&snapshot);
            debug!(
                "{}: attempt {}/{} -> {} ({})",
                profile.name, attempt, max_attempts, action, profile.health
            );

            match action {
                Action::ReportOnly => {
                    // True divergence needs a human merge decision; the
                    // result carries it as a conflict, not a silent report
                    if let LocalState::Diverged { ahead, behind } = snapshot.local {
                        if ahead > 0 {
                            error = Some(
                                EngineError::Conflict {
                                    path: profile.local_path.clone(),
                                    ahead,
                                    behind,
                                }
                                .to_string(),
                            );
                        }
                    }
                    info!("{}: {} ({})", profile.name, profile.health, profile.health.reason());
                    break;
                }
                Action::RetryLater => {
                    let delay = self.config.backoff_delay(attempt);
                    debug!("{}: transient state, retrying in {:?}", profile.name, delay);
                    if self.check_cancelled().is_err() {
                        error = Some(EngineError::Cancelled.to_string());
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Action::RegenerateSshConfig => {
                    if let Err(e) = self.check_cancelled() {
                        error = Some(e.to_string());
                        break;
                    }
                    match self.execute(action, &profile, &key_path, options).await {
                        // Repair done; the next attempt re-validates
                        Ok(()) => continue,
                        Err(e) => {
                            error = Some(e.to_string());
                            break;
                        }
                    }
                }
                Action::Clone | Action::Pull | Action::ReinitRemote | Action::ReCloneFresh => {
                    if let Err(e) = self.check_cancelled() {
                        error = Some(e.to_string());
                        break;
                    }

                    match self.execute(action, &profile, &key_path, options).await {
                        Ok(()) => {
                            match self.verify(&profile).await {
                                Ok(health) => {
                                    profile.health = health;
                                    if health == HealthStatus::Healthy {
                                        profile.last_sync = Some(chrono::Utc::now());
                                        info!("{}: synced ({})", profile.name, action);
                                    } else {
                                        warn!(
                                            "{}: {} completed but tree is {}",
                                            profile.name, action, health
                                        );
                                    }
                                }
                                Err(e) => {
                                    error = Some(e.to_string());
                                    profile.health = HealthStatus::Unknown;
                                }
                            }
                            break;
                        }
                        Err(e) if e.is_transient() && attempt < max_attempts => {
                            let delay = self.config.backoff_delay(attempt);
                            warn!(
                                "{}: {} failed transiently ({}), retrying in {:?}",
                                profile.name, action, e, delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        Err(e) => {
                            warn!("{}: {} failed: {}", profile.name, action, e);
                            error = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
        }

        SyncResult {
            profile,
            prior_health,
            action: last_action,
            attempts,
            error,
            duration: started.elapsed(),
        }
    }

    /// Sync a batch of repositories with bounded parallelism.
    ///
    /// Results arrive in completion order, not input order.
    pub async fn sync_all(self: &Arc<Self>, jobs: Vec<SyncJob>, options: SyncOptions) -> SyncSummary {
        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_parallel.max(1)));
        let mut tasks = FuturesUnordered::new();

        for job in jobs {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let options = options.clone();

            tasks.push(tokio::spawn(async move {
                // Closed semaphore is unreachable: it lives as long as the tasks
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                engine.sync_one(job, &options).await
            }));
        }

        let mut summary = SyncSummary::default();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(result) => summary.results.push(result),
                Err(e) => warn!("sync task panicked: {}", e),
            }
        }

        info!(
            "Sync finished: {}/{} healthy, {} failed",
            summary.healthy(),
            summary.results.len(),
            summary.failed()
        );
        summary
    }

    /// Probe a batch of repositories without mutating anything
    pub async fn check_health_all(self: &Arc<Self>, jobs: Vec<SyncJob>) -> Vec<SyncResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_parallel.max(1)));
        let mut tasks = FuturesUnordered::new();

        for job in jobs {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let started = Instant::now();
                let prior_health = job.profile.health;
                let mut profile = job.profile.clone();

                let error = match engine.check_health(&job).await {
                    Ok((health, _)) => {
                        profile.health = health;
                        None
                    }
                    Err(e) => {
                        profile.health = HealthStatus::Unknown;
                        Some(e.to_string())
                    }
                };

                SyncResult {
                    profile,
                    prior_health,
                    action: None,
                    attempts: 1,
                    error,
                    duration: started.elapsed(),
                }
            }));
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("health task panicked: {}", e),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{MockGitExecutor, PullOutcome, WorkTreeStatus};
    use crate::github::{AuthState, MockTokenValidator};
    use crate::net::MockConnectivityProbe;
    use crate::ssh::{MockSshCheck, SshState};
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    const REMOTE: &str = "git@github.com:octocat/hello-world.git";

    fn test_config(base: &Path) -> Config {
        let mut config = Config::default();
        config.base_directory = base.to_string_lossy().into_owned();
        // No real sleeping in tests
        config.retry.backoff_base = 0;
        config
    }

    fn reachable_net() -> MockConnectivityProbe {
        let mut net = MockConnectivityProbe::new();
        net.expect_probe().returning(|_| NetState::Reachable);
        net
    }

    fn valid_ssh() -> MockSshCheck {
        let mut ssh = MockSshCheck::new();
        ssh.expect_validate().returning(|_, _| SshState::Valid);
        ssh
    }

    fn engine(
        base: &Path,
        git: MockGitExecutor,
        net: MockConnectivityProbe,
        ssh: MockSshCheck,
        auth: MockTokenValidator,
    ) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(
            test_config(base),
            Arc::new(git),
            Arc::new(net),
            Arc::new(ssh),
            Arc::new(auth),
        ))
    }

    fn profile_at(base: &Path, name: &str) -> RepositoryProfile {
        RepositoryProfile::new(name, base.join(name), REMOTE)
    }

    fn make_git_dir(path: &Path) {
        std::fs::create_dir_all(path.join(".git")).unwrap();
    }

    fn clean_status() -> WorkTreeStatus {
        WorkTreeStatus {
            remote_url: Some(REMOTE.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_absent_repository_is_cloned() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "hello-world");
        let target = profile.local_path.clone();

        let mut git = MockGitExecutor::new();
        git.expect_clone_repo().times(1).returning(move |_, path| {
            // The clone materializes the tree the verify step re-inspects
            std::fs::create_dir_all(path.join(".git")).unwrap();
            Ok(())
        });
        git.expect_status().returning(|_| Ok(clean_status()));

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(result.succeeded(), "error: {:?}", result.error);
        assert_eq!(result.action, Some(Action::Clone));
        assert_eq!(result.profile.health, HealthStatus::Healthy);
        assert!(result.profile.last_sync.is_some());
        assert!(target.join(".git").is_dir());
    }

    #[tokio::test]
    async fn test_behind_only_tree_is_pulled() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "behind");
        make_git_dir(&profile.local_path);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_status = Arc::clone(&calls);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(move |_| {
            // Behind before the pull, clean afterwards
            if calls_in_status.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(WorkTreeStatus {
                    behind: 3,
                    remote_url: Some(REMOTE.to_string()),
                    ..Default::default()
                })
            } else {
                Ok(clean_status())
            }
        });
        git.expect_pull()
            .times(1)
            .returning(|_| Ok(PullOutcome::Updated { commits: 3 }));

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(result.succeeded());
        assert_eq!(result.action, Some(Action::Pull));
        assert_eq!(result.profile.health, HealthStatus::Healthy);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_dirty_tree_reports_without_touching_remote() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "dirty");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| {
            Ok(WorkTreeStatus {
                dirty: true,
                remote_url: Some(REMOTE.to_string()),
                ..Default::default()
            })
        });

        // No expectations on the probes: any call would panic the mock
        let engine = engine(
            temp.path(),
            git,
            MockConnectivityProbe::new(),
            MockSshCheck::new(),
            MockTokenValidator::new(),
        );
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(result.succeeded());
        assert_eq!(result.action, Some(Action::ReportOnly));
        assert_eq!(result.profile.health, HealthStatus::Dirty);
        assert!(result.profile.last_sync.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_network_retries_to_the_cap() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "offline");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| Ok(clean_status()));

        let mut net = MockConnectivityProbe::new();
        net.expect_probe()
            .times(3)
            .returning(|_| NetState::TcpUnreachable);

        let engine = engine(temp.path(), git, net, MockSshCheck::new(), MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert_eq!(result.attempts, 3);
        assert_eq!(result.action, Some(Action::ReportOnly));
        assert_eq!(result.profile.health, HealthStatus::NetworkUnreachable);
    }

    #[tokio::test]
    async fn test_invalid_token_reports_and_skips_git() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "badtoken");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| Ok(clean_status()));

        let mut auth = MockTokenValidator::new();
        auth.expect_validate_token()
            .returning(|_| AuthState::Invalid);

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), auth);
        let mut job = SyncJob::new(profile);
        job.token = Some("ghp_expired".to_string());

        let result = engine.sync_one(job, &SyncOptions::default()).await;

        assert!(result.succeeded());
        assert_eq!(result.action, Some(Action::ReportOnly));
        assert_eq!(result.profile.health, HealthStatus::AuthInvalid);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_wrong_remote_needs_confirmation() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "hijacked");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| {
            Ok(WorkTreeStatus {
                remote_url: Some("git@github.com:someone-else/other.git".to_string()),
                ..Default::default()
            })
        });
        // remove_tree and clone_repo must not run without confirmation

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(!result.succeeded());
        assert!(result.error.as_ref().unwrap().contains("confirmation"));
        assert_eq!(result.action, Some(Action::ReCloneFresh));
        assert_eq!(result.profile.health, HealthStatus::RemoteMismatch);
    }

    #[tokio::test]
    async fn test_confirmed_re_clone_removes_and_clones() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "rebuild");
        make_git_dir(&profile.local_path);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_status = Arc::clone(&calls);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(move |_| {
            if calls_in_status.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(WorkTreeStatus {
                    remote_url: Some("git@github.com:someone-else/other.git".to_string()),
                    ..Default::default()
                })
            } else {
                Ok(clean_status())
            }
        });
        git.expect_remove_tree().times(1).returning(|_| Ok(()));
        git.expect_clone_repo().times(1).returning(|_, path| {
            std::fs::create_dir_all(path.join(".git")).unwrap();
            Ok(())
        });

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let options = SyncOptions {
            confirm_destructive: true,
        };
        let result = engine.sync_one(SyncJob::new(profile), &options).await;

        assert!(result.succeeded(), "error: {:?}", result.error);
        assert_eq!(result.action, Some(Action::ReCloneFresh));
        assert_eq!(result.profile.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_missing_key_is_regenerated_then_synced() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "keyless");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| Ok(clean_status()));
        git.expect_pull()
            .times(1)
            .returning(|_| Ok(PullOutcome::AlreadyUpToDate));

        let validations = Arc::new(AtomicU32::new(0));
        let validations_in_mock = Arc::clone(&validations);

        let mut ssh = MockSshCheck::new();
        ssh.expect_validate().returning(move |_, _| {
            // Missing before the repair, valid afterwards
            if validations_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                SshState::KeyMissing
            } else {
                SshState::Valid
            }
        });
        ssh.expect_regenerate().times(1).returning(|_, _| Ok(()));

        let engine = engine(temp.path(), git, reachable_net(), ssh, MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(result.succeeded(), "error: {:?}", result.error);
        assert_eq!(result.action, Some(Action::Pull));
        assert_eq!(result.profile.health, HealthStatus::Healthy);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_transient_clone_failure_retries() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "flaky");

        let clones = Arc::new(AtomicU32::new(0));
        let clones_in_mock = Arc::clone(&clones);

        let mut git = MockGitExecutor::new();
        git.expect_clone_repo().times(2).returning(move |_, path| {
            if clones_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::Network("connection reset".to_string()))
            } else {
                std::fs::create_dir_all(path.join(".git")).unwrap();
                Ok(())
            }
        });
        git.expect_remove_tree().returning(|_| Ok(()));
        git.expect_status().returning(|_| Ok(clean_status()));

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(result.succeeded(), "error: {:?}", result.error);
        assert_eq!(result.profile.health, HealthStatus::Healthy);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancelled_engine_does_nothing() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "cancelled");

        // Git must never run after cancellation
        let engine = engine(
            temp.path(),
            MockGitExecutor::new(),
            MockConnectivityProbe::new(),
            MockSshCheck::new(),
            MockTokenValidator::new(),
        );
        engine.cancel_flag().cancel();

        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(!result.succeeded());
        assert!(result.error.as_ref().unwrap().contains("cancelled"));
        assert_eq!(result.action, None);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_on_healthy_tree() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "steady");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| Ok(clean_status()));
        // Two runs, one routine pull each
        git.expect_pull()
            .times(2)
            .returning(|_| Ok(PullOutcome::AlreadyUpToDate));

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());

        let first = engine
            .sync_one(SyncJob::new(profile.clone()), &SyncOptions::default())
            .await;
        let second = engine
            .sync_one(SyncJob::new(first.profile.clone()), &SyncOptions::default())
            .await;

        assert_eq!(first.profile.health, HealthStatus::Healthy);
        assert_eq!(second.profile.health, HealthStatus::Healthy);
        assert_eq!(second.action, Some(Action::Pull));
    }

    #[tokio::test]
    async fn test_sync_all_runs_every_job() {
        let temp = TempDir::new().unwrap();

        let mut git = MockGitExecutor::new();
        git.expect_clone_repo().times(3).returning(|_, path| {
            std::fs::create_dir_all(path.join(".git")).unwrap();
            Ok(())
        });
        git.expect_status().returning(|_| Ok(clean_status()));

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());

        let jobs: Vec<SyncJob> = ["one", "two", "three"]
            .iter()
            .map(|name| SyncJob::new(profile_at(temp.path(), name)))
            .collect();

        let summary = engine.sync_all(jobs, SyncOptions::default()).await;

        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.healthy(), 3);
        assert!(summary.all_ok());
    }

    #[tokio::test]
    async fn test_check_health_takes_no_action() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "observed");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| {
            Ok(WorkTreeStatus {
                ahead: 1,
                behind: 2,
                remote_url: Some(REMOTE.to_string()),
                ..Default::default()
            })
        });
        // No pull/clone expectations: health checks never mutate

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let (health, snapshot) = engine
            .check_health(&SyncJob::new(profile))
            .await
            .unwrap();

        assert_eq!(health, HealthStatus::Diverged);
        assert!(matches!(
            snapshot.local,
            crate::inspect::LocalState::Diverged { ahead: 1, behind: 2 }
        ));
    }

    #[tokio::test]
    async fn test_true_divergence_surfaces_a_conflict() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "forked");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| {
            Ok(WorkTreeStatus {
                ahead: 2,
                behind: 1,
                remote_url: Some(REMOTE.to_string()),
                ..Default::default()
            })
        });
        // No pull: local commits must not be merged away automatically

        let engine = engine(temp.path(), git, reachable_net(), valid_ssh(), MockTokenValidator::new());
        let result = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;

        assert!(!result.succeeded());
        assert!(result.error.as_ref().unwrap().contains("conflict"));
        assert!(result.error.as_ref().unwrap().contains("2 ahead"));
        assert_eq!(result.action, Some(Action::ReportOnly));
        assert_eq!(result.profile.health, HealthStatus::Diverged);
    }

    #[tokio::test]
    async fn test_lock_file_survives_release_and_relocks() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "locked");
        make_git_dir(&profile.local_path);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(|_| {
            Ok(WorkTreeStatus {
                dirty: true,
                remote_url: Some(REMOTE.to_string()),
                ..Default::default()
            })
        });

        let engine = engine(
            temp.path(),
            git,
            MockConnectivityProbe::new(),
            MockSshCheck::new(),
            MockTokenValidator::new(),
        );

        let first = engine
            .sync_one(SyncJob::new(profile.clone()), &SyncOptions::default())
            .await;
        assert!(first.succeeded());

        // The lock file is never unlinked, and relocking the same path works
        let lock_path = temp.path().join(".locked.sync.lock");
        assert!(lock_path.is_file());

        let second = engine
            .sync_one(SyncJob::new(profile), &SyncOptions::default())
            .await;
        assert!(second.succeeded());
        assert!(lock_path.is_file());
    }

    #[tokio::test]
    async fn test_same_tree_never_syncs_concurrently() {
        let temp = TempDir::new().unwrap();
        let profile = profile_at(temp.path(), "contended");
        make_git_dir(&profile.local_path);

        let in_flight = Arc::new(AtomicU32::new(0));
        let in_flight_probe = Arc::clone(&in_flight);

        let mut git = MockGitExecutor::new();
        git.expect_status().returning(move |_| {
            let now = in_flight_probe.fetch_add(1, Ordering::SeqCst);
            assert_eq!(now, 0, "two syncs entered the same tree");
            std::thread::sleep(std::time::Duration::from_millis(20));
            in_flight_probe.fetch_sub(1, Ordering::SeqCst);
            Ok(WorkTreeStatus {
                dirty: true,
                remote_url: Some(REMOTE.to_string()),
                ..Default::default()
            })
        });

        let engine = engine(
            temp.path(),
            git,
            MockConnectivityProbe::new(),
            MockSshCheck::new(),
            MockTokenValidator::new(),
        );

        let jobs = vec![SyncJob::new(profile.clone()), SyncJob::new(profile)];
        let summary = engine.sync_all(jobs, SyncOptions::default()).await;

        assert_eq!(summary.results.len(), 2);
        for result in &summary.results {
            assert_eq!(result.profile.health, HealthStatus::Dirty);
        }
    }
}
