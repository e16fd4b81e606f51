//! RepoMedic - Git Repository Synchronization & Health Engine
//!
//! RepoMedic keeps a set of locally-managed git repositories converged with
//! their remotes. Each repository is probed (local tree, network, SSH,
//! GitHub token), the probe states feed a pure decision table that picks a
//! corrective action, and the engine executes that action and verifies the
//! result. It never destroys uncommitted work and never deletes a tree
//! without explicit confirmation.
//!
//! ## Core Features
//!
//! - **Health Probes**: Local tree classification, DNS/TCP reachability,
//!   SSH key validation, token validation
//! - **Pure Planning**: A total decision table over probe states, bounded
//!   retries for transient failures
//! - **Safe Repair**: SSH key/config regeneration, remote re-pointing,
//!   confirmed re-clone of broken trees
//! - **Profiles**: YAML-persisted repository and user profiles with derived
//!   health status
//!
//! ## Modules
//!
//! - [`planner`]: The decision core mapping probe snapshots to actions
//! - [`sync`]: Orchestration: probe, plan, execute, verify, retry

pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod inspect;
pub mod net;
pub mod planner;
pub mod profile;
pub mod ssh;
pub mod sync;

pub use config::Config;
pub use error::EngineError;
pub use git::{GitCli, GitExecutor};
pub use github::{AuthState, GitHubClient, TokenValidator};
pub use inspect::{LocalState, RepoInspector};
pub use net::{ConnectivityProbe, NetState, NetworkProbe};
pub use planner::{Action, ActionPlanner, ProbeSnapshot};
pub use profile::{HealthStatus, ProfileStore, Profiles, RepositoryProfile, UserProfile};
pub use ssh::{SshCheck, SshState, SshValidator};
pub use sync::{CancelFlag, SyncEngine, SyncJob, SyncOptions, SyncResult, SyncSummary};
