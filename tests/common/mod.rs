/// Common test utilities and helpers for repomedic tests
use async_trait::async_trait;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use repomedic::error::Result;
use repomedic::github::{AuthState, TokenValidator};
use repomedic::net::{ConnectivityProbe, NetState};
use repomedic::ssh::{SshCheck, SshState};

/// Test configuration helper
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub original_env: Vec<(String, Option<String>)>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("repomedic");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        // Store original environment variables
        let env_vars = vec!["GITHUB_TOKEN", "XDG_CONFIG_HOME", "HOME"];
        let original_env = env_vars
            .iter()
            .map(|var| (var.to_string(), env::var(var).ok()))
            .collect();

        Self {
            temp_dir,
            config_dir,
            original_env,
        }
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            r#"
base_directory: "{}"
retry:
  max_attempts: 2
  backoff_base: 0
sync:
  max_parallel: 2
"#,
            self.temp_dir.path().join("dev").display()
        );
        self.create_test_config(&config_content)
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        // Restore original environment variables
        for (key, value) in &self.original_env {
            match value {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

fn git(args: &[&str], cwd: &Path) {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create an "origin" repository with one commit; clones of it behave like a
/// real remote over the file transport
pub fn init_origin(dir: &Path) -> PathBuf {
    let origin = dir.join("origin");
    std::fs::create_dir_all(&origin).expect("Failed to create origin dir");

    git(&["init", "--initial-branch=main"], &origin);
    git(&["config", "user.email", "test@example.com"], &origin);
    git(&["config", "user.name", "Test"], &origin);

    std::fs::write(origin.join("README.md"), "origin\n").unwrap();
    git(&["add", "."], &origin);
    git(&["commit", "-m", "initial"], &origin);

    // Clones push and pull against a checked-out tree in tests
    git(&["config", "receive.denyCurrentBranch", "ignore"], &origin);

    origin
}

/// Add a commit to a repository
pub fn commit_file(repo: &Path, name: &str, content: &str) {
    std::fs::write(repo.join(name), content).unwrap();
    git(&["add", "."], repo);
    git(&["commit", "-m", name], repo);
}

/// Connectivity probe that always reports the host reachable
pub struct AlwaysReachable;

#[async_trait]
impl ConnectivityProbe for AlwaysReachable {
    async fn probe(&self, _host: &str) -> NetState {
        NetState::Reachable
    }
}

/// SSH check that always passes and records nothing
pub struct AlwaysValidSsh;

#[async_trait]
impl SshCheck for AlwaysValidSsh {
    async fn validate(&self, _key_path: &Path, _host: &str) -> SshState {
        SshState::Valid
    }

    async fn regenerate(&self, _key_path: &Path, _host: &str) -> Result<()> {
        Ok(())
    }
}

/// Token validator that accepts anything
pub struct AcceptAllTokens;

#[async_trait]
impl TokenValidator for AcceptAllTokens {
    async fn validate_token(&self, _token: &str) -> AuthState {
        AuthState::Valid
    }
}
