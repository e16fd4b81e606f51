//! Action planning
//!
//! `decide` is a pure, total function over the probe state enumerations plus
//! the attempt counter. No I/O, no clock, no hidden state: the same inputs
//! always produce the same action, which keeps the repair policy testable as
//! a table.
//!
//! The precedence recognizes credential and connectivity problems before
//! anything touches the working tree. Destructive repair is considered only
//! after the safer diagnoses, and a dirty tree always stops the engine.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::github::AuthState;
use crate::inspect::LocalState;
use crate::net::NetState;
use crate::profile::HealthStatus;
use crate::ssh::SshState;

/// Corrective action chosen for one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Clone,
    Pull,
    /// Re-point origin at the expected URL (non-destructive)
    ReinitRemote,
    RegenerateSshConfig,
    /// Delete the tree and clone fresh; requires caller confirmation
    ReCloneFresh,
    /// Terminal state the engine will not fix on its own
    ReportOnly,
    /// Transient state; retry with backoff
    RetryLater,
}

impl Action {
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::ReCloneFresh)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Clone => "clone",
            Self::Pull => "pull",
            Self::ReinitRemote => "reinit-remote",
            Self::RegenerateSshConfig => "regenerate-ssh",
            Self::ReCloneFresh => "re-clone",
            Self::ReportOnly => "report-only",
            Self::RetryLater => "retry-later",
        };
        write!(f, "{}", label)
    }
}

/// Raw probe results for one sync attempt
///
/// `None` records a probe the engine skipped: the local state alone was
/// terminal, so no remote call could have changed the decision. Owned by the
/// attempt that produced it and discarded once consumed.
#[derive(Debug, Clone)]
pub struct ProbeSnapshot {
    pub local: LocalState,
    pub ssh: Option<SshState>,
    pub net: Option<NetState>,
    pub auth: Option<AuthState>,
    pub taken_at: DateTime<Utc>,
}

impl ProbeSnapshot {
    pub fn new(local: LocalState) -> Self {
        Self {
            local,
            ssh: None,
            net: None,
            auth: None,
            taken_at: Utc::now(),
        }
    }

    /// Skipped probes cannot veto a local-only decision, so they enter the
    /// planner as pass-through values.
    pub fn ssh_or_assumed(&self) -> SshState {
        self.ssh.unwrap_or(SshState::Valid)
    }

    pub fn net_or_assumed(&self) -> NetState {
        self.net.unwrap_or(NetState::Reachable)
    }

    pub fn auth_or_assumed(&self) -> AuthState {
        self.auth.unwrap_or(AuthState::Valid)
    }
}

/// Pure decision table mapping probe states to the next action.
pub struct ActionPlanner;

impl ActionPlanner {
    /// Decide the corrective action for one attempt.
    ///
    /// `attempt` is 1-based; once it reaches `max_attempts`, transient states
    /// stop retrying and degrade to `ReportOnly`.
    pub fn decide(
        local: &LocalState,
        ssh: SshState,
        net: NetState,
        auth: AuthState,
        attempt: u32,
        max_attempts: u32,
    ) -> Action {
        let bounded_retry = if attempt < max_attempts {
            Action::RetryLater
        } else {
            Action::ReportOnly
        };

        // Credentials are never auto-regenerated; an invalid token stops
        // everything regardless of local or network state
        if auth == AuthState::Invalid {
            return Action::ReportOnly;
        }

        // Connectivity gates every remote action, cloning included
        if net != NetState::Reachable {
            return bounded_retry;
        }

        match ssh {
            SshState::KeyMissing | SshState::KeyBadPermissions => {
                return Action::RegenerateSshConfig
            }
            // A definitive remote rejection needs a user trust decision
            SshState::HostUntrusted => return Action::ReportOnly,
            SshState::Unknown => return bounded_retry,
            SshState::Valid => {}
        }

        // Rate limits and transport hiccups clear on their own
        if matches!(auth, AuthState::RateLimited | AuthState::Unknown) {
            return bounded_retry;
        }

        match local {
            LocalState::Absent => Action::Clone,
            LocalState::NotRepo | LocalState::WrongRemote { .. } => Action::ReCloneFresh,
            LocalState::Dirty => Action::ReportOnly,
            LocalState::Diverged { ahead, behind } => {
                if *ahead == 0 && *behind > 0 {
                    Action::Pull
                } else {
                    Action::ReportOnly
                }
            }
            // Routine fast-forward; a no-change pull reports Healthy
            LocalState::Clean => Action::Pull,
        }
    }

    /// Decide from a snapshot, filling skipped probes with pass-through values
    pub fn decide_snapshot(snapshot: &ProbeSnapshot, attempt: u32, max_attempts: u32) -> Action {
        Self::decide(
            &snapshot.local,
            snapshot.ssh_or_assumed(),
            snapshot.net_or_assumed(),
            snapshot.auth_or_assumed(),
            attempt,
            max_attempts,
        )
    }
}

impl HealthStatus {
    /// Derive the health status from a probe snapshot.
    ///
    /// Pure: the status is never hand-set, only computed. The precedence
    /// mirrors the planner so a status always explains its action.
    pub fn from_snapshot(snapshot: &ProbeSnapshot) -> HealthStatus {
        if snapshot.auth == Some(AuthState::Invalid) {
            return HealthStatus::AuthInvalid;
        }

        match snapshot.net {
            Some(NetState::DnsFailure) | Some(NetState::TcpUnreachable) => {
                return HealthStatus::NetworkUnreachable
            }
            _ => {}
        }

        match snapshot.ssh {
            Some(SshState::KeyMissing)
            | Some(SshState::KeyBadPermissions)
            | Some(SshState::HostUntrusted) => return HealthStatus::SshInvalid,
            Some(SshState::Unknown) => return HealthStatus::Unknown,
            _ => {}
        }

        if matches!(
            snapshot.auth,
            Some(AuthState::RateLimited) | Some(AuthState::Unknown)
        ) {
            return HealthStatus::Unknown;
        }

        match &snapshot.local {
            LocalState::Absent => HealthStatus::Missing,
            LocalState::NotRepo => HealthStatus::NotARepo,
            LocalState::WrongRemote { .. } => HealthStatus::RemoteMismatch,
            LocalState::Dirty => HealthStatus::Dirty,
            LocalState::Diverged { ahead, .. } if *ahead > 0 => HealthStatus::Diverged,
            // Behind-only trees fast-forward on the next routine pull
            LocalState::Diverged { .. } | LocalState::Clean => HealthStatus::Healthy,
        }
    }
}
