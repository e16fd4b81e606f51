//! Error taxonomy for the synchronization engine
//!
//! Probe failures (network, ssh) are never surfaced through this type; they
//! become enumerated probe states that flow into the action planner as data.
//! `EngineError` covers filesystem access, git process execution, GitHub API
//! calls, and policy violations such as unconfirmed destructive repairs.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem access failed (permission denied, unreadable metadata).
    /// Distinct from a path that simply does not exist.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The git executable exited non-zero.
    #[error("git exited with code {exit_code}: {stderr}")]
    Process { exit_code: i32, stderr: String },

    /// DNS, TCP, or timeout failure while talking to the remote.
    #[error("network error: {0}")]
    Network(String),

    /// Invalid or expired token, or the API rate limit was exhausted.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Local and remote histories have diverged and cannot fast-forward.
    #[error("history conflict at {path}: {ahead} ahead, {behind} behind")]
    Conflict {
        path: PathBuf,
        ahead: u32,
        behind: u32,
    },

    /// A destructive repair (re-clone) was planned but the caller did not
    /// pass the confirmation flag.
    #[error("destructive action denied for {path}: re-clone requires explicit confirmation")]
    DestructiveActionDenied { path: PathBuf },

    /// Another process holds the sync lock for this working tree.
    #[error("another sync holds the lock for {path}")]
    Busy { path: PathBuf },

    /// The sync was cancelled between steps.
    #[error("sync cancelled")]
    Cancelled,

    /// Configuration or profile store failure.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures worth retrying (network-shaped), false for
    /// deterministic ones.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
