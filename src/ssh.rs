//! SSH key validation and repair
//!
//! Validation short-circuits: a missing key never attempts a handshake, and a
//! key with loose permissions is reported before any network traffic. The
//! repair half regenerates what validation found missing (key material,
//! permission bits, known_hosts entry, and the `Host` block in the SSH
//! config).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// Outcome of SSH validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshState {
    KeyMissing,
    /// Key is group- or world-readable
    KeyBadPermissions,
    /// The remote definitively rejected us (host key mismatch or publickey
    /// refusal)
    HostUntrusted,
    Valid,
    /// Network-layer failure during the handshake; nothing definitive
    Unknown,
}

/// SSH validation and repair seam consumed by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SshCheck: Send + Sync {
    /// Run the short-circuiting check chain against `host`
    async fn validate(&self, key_path: &Path, host: &str) -> SshState;

    /// Repair whatever `validate` reported: generate a missing key, fix
    /// permission bits, seed known_hosts, write the config block
    async fn regenerate(&self, key_path: &Path, host: &str) -> Result<()>;
}

/// Production validator shelling out to the OpenSSH tooling
#[derive(Debug, Clone)]
pub struct SshValidator {
    handshake_timeout: Duration,
}

impl SshValidator {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Private keys must not be group- or world-accessible
    #[cfg(unix)]
    fn permissions_ok(key_path: &Path) -> std::io::Result<bool> {
        use std::os::unix::fs::PermissionsExt;

        let mode = std::fs::metadata(key_path)?.permissions().mode();
        Ok(mode & 0o077 == 0)
    }

    #[cfg(not(unix))]
    fn permissions_ok(_key_path: &Path) -> std::io::Result<bool> {
        Ok(true)
    }

    /// Auth-only handshake probe: `ssh -T git@host` in batch mode.
    ///
    /// GitHub closes the session with exit code 1 even on success, so the
    /// classification reads the banner text rather than the exit code.
    async fn handshake(&self, key_path: &Path, host: &str) -> SshState {
        let connect_timeout = self.handshake_timeout.as_secs().max(1).to_string();
        let target = format!("git@{}", host);

        let mut cmd = AsyncCommand::new("ssh");
        cmd.args([
            "-i",
            &key_path.to_string_lossy(),
            "-o",
            "BatchMode=yes",
            "-o",
            &format!("ConnectTimeout={}", connect_timeout),
            "-T",
            &target,
        ]);

        let output = match timeout(self.handshake_timeout.saturating_mul(2), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to spawn ssh: {}", e);
                return SshState::Unknown;
            }
            Err(_) => {
                debug!("SSH handshake to {} timed out", host);
                return SshState::Unknown;
            }
        };

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout).to_lowercase(),
            String::from_utf8_lossy(&output.stderr).to_lowercase()
        );

        if combined.contains("successfully authenticated") {
            return SshState::Valid;
        }

        if combined.contains("host key verification failed")
            || combined.contains("permission denied (publickey")
        {
            debug!("Remote rejected the handshake: {}", host);
            return SshState::HostUntrusted;
        }

        debug!("Inconclusive ssh handshake output for {}", host);
        SshState::Unknown
    }

    fn ssh_dir(key_path: &Path) -> PathBuf {
        key_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    async fn generate_key(&self, key_path: &Path) -> Result<()> {
        let ssh_dir = Self::ssh_dir(key_path);
        tokio::fs::create_dir_all(&ssh_dir)
            .await
            .map_err(|e| EngineError::io(&ssh_dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| EngineError::io(&ssh_dir, e))?;
        }

        let output = AsyncCommand::new("ssh-keygen")
            .args([
                "-t",
                "ed25519",
                "-C",
                "repomedic",
                "-f",
                &key_path.to_string_lossy(),
                "-N",
                "",
                "-q",
            ])
            .output()
            .await
            .map_err(|e| EngineError::io(key_path, e))?;

        if !output.status.success() {
            return Err(EngineError::Process {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("Generated ed25519 key at {}", key_path.display());
        Ok(())
    }

    fn fix_permissions(key_path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| EngineError::io(key_path, e))?;

            let public = key_path.with_extension("pub");
            if public.exists() {
                std::fs::set_permissions(&public, std::fs::Permissions::from_mode(0o644))
                    .map_err(|e| EngineError::io(&public, e))?;
            }

            let ssh_dir = Self::ssh_dir(key_path);
            std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| EngineError::io(&ssh_dir, e))?;
        }
        #[cfg(not(unix))]
        let _ = key_path;

        Ok(())
    }

    /// Append the host's public keys to known_hosts via ssh-keyscan
    async fn seed_known_hosts(&self, key_path: &Path, host: &str) -> Result<()> {
        let output = match timeout(
            self.handshake_timeout,
            AsyncCommand::new("ssh-keyscan").arg(host).output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EngineError::io("ssh-keyscan", e)),
            Err(_) => {
                return Err(EngineError::Network(format!(
                    "ssh-keyscan {} timed out",
                    host
                )))
            }
        };

        if !output.status.success() || output.stdout.is_empty() {
            return Err(EngineError::Network(format!(
                "ssh-keyscan {} returned no host keys",
                host
            )));
        }

        let known_hosts = Self::ssh_dir(key_path).join("known_hosts");
        let mut existing = match tokio::fs::read_to_string(&known_hosts).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(EngineError::io(&known_hosts, e)),
        };

        let scanned = String::from_utf8_lossy(&output.stdout);
        for line in scanned.lines().filter(|l| !l.starts_with('#')) {
            if !existing.contains(line) {
                existing.push_str(line);
                existing.push('\n');
            }
        }

        tokio::fs::write(&known_hosts, existing)
            .await
            .map_err(|e| EngineError::io(&known_hosts, e))?;

        info!("Seeded known_hosts with keys for {}", host);
        Ok(())
    }

    /// Write a Host block pointing at the managed key, unless one exists
    async fn write_config_block(&self, key_path: &Path, host: &str) -> Result<()> {
        let config_path = Self::ssh_dir(key_path).join("config");

        let existing = match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(EngineError::io(&config_path, e)),
        };

        if existing.to_lowercase().contains(&host.to_lowercase()) {
            debug!("SSH config already mentions {}", host);
            return Ok(());
        }

        let block = format!(
            "\nHost {host}\n    HostName {host}\n    User git\n    IdentityFile {key}\n    IdentitiesOnly yes\n    PreferredAuthentications publickey\n",
            host = host,
            key = key_path.display()
        );

        tokio::fs::write(&config_path, format!("{}{}", existing, block))
            .await
            .map_err(|e| EngineError::io(&config_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| EngineError::io(&config_path, e))?;
        }

        info!("Wrote SSH config block for {}", host);
        Ok(())
    }
}

#[async_trait]
impl SshCheck for SshValidator {
    async fn validate(&self, key_path: &Path, host: &str) -> SshState {
        if !key_path.exists() {
            debug!("SSH key missing: {}", key_path.display());
            return SshState::KeyMissing;
        }

        match Self::permissions_ok(key_path) {
            Ok(true) => {}
            Ok(false) => {
                debug!("SSH key has loose permissions: {}", key_path.display());
                return SshState::KeyBadPermissions;
            }
            Err(e) => {
                warn!("Could not stat {}: {}", key_path.display(), e);
                return SshState::Unknown;
            }
        }

        self.handshake(key_path, host).await
    }

    async fn regenerate(&self, key_path: &Path, host: &str) -> Result<()> {
        if !key_path.exists() {
            self.generate_key(key_path).await?;
        } else {
            Self::fix_permissions(key_path)?;
        }

        if let Err(e) = self.seed_known_hosts(key_path, host).await {
            // Host keys can be trusted later; key material is the repair goal
            warn!("known_hosts seeding failed: {}", e);
        }

        self.write_config_block(key_path, host).await?;

        Ok(())
    }
}
