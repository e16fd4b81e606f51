//! GitHub API collaborator
//!
//! Token validation and repository listing over octocrab. A bad token is a
//! probe state (`AuthState::Invalid`), not an error; only transport failures
//! that prevent any answer surface as `Unknown`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// Outcome of token validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Valid,
    /// Rejected by GitHub (expired, revoked, malformed)
    Invalid,
    /// Token works but the API quota is exhausted
    RateLimited,
    /// Transport failure; validity not determined
    Unknown,
}

/// Minimal repository metadata the engine cares about
#[derive(Debug, Clone)]
pub struct RemoteRepo {
    pub name: String,
    pub full_name: String,
    pub ssh_url: Option<String>,
    pub default_branch: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Token validation seam consumed by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> AuthState;
}

/// GitHub client wrapper; one instance per operation, no cached session
#[derive(Debug, Clone, Default)]
pub struct GitHubClient;

impl GitHubClient {
    pub fn new() -> Self {
        Self
    }

    fn build(token: &str) -> Result<Octocrab> {
        Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .map_err(|e| EngineError::Auth(format!("failed to build GitHub client: {}", e)))
    }

    fn classify_error(err: &octocrab::Error) -> AuthState {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let message = source.message.to_lowercase();

                if status == 401 {
                    AuthState::Invalid
                } else if status == 403 || status == 429 {
                    if message.contains("rate limit") {
                        AuthState::RateLimited
                    } else {
                        AuthState::Invalid
                    }
                } else {
                    AuthState::Unknown
                }
            }
            _ => AuthState::Unknown,
        }
    }

    /// List all repositories visible to the token, SSH URLs included
    pub async fn list_repos(&self, token: &str) -> Result<Vec<RemoteRepo>> {
        let client = Self::build(token)?;

        let mut repositories = Vec::new();
        let mut page = 1u8;

        loop {
            let page_repos = client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(100)
                .page(page)
                .send()
                .await
                .map_err(|e| EngineError::Auth(format!("failed to list repositories: {}", e)))?;

            let items = page_repos.items;
            if items.is_empty() {
                break;
            }

            repositories.extend(items.into_iter().map(|repo| RemoteRepo {
                full_name: repo.full_name.clone().unwrap_or_else(|| repo.name.clone()),
                ssh_url: repo.ssh_url,
                default_branch: repo.default_branch,
                pushed_at: repo.pushed_at,
                name: repo.name,
            }));

            // GitHub API pagination limit for u8
            if page >= 255 {
                warn!("Reached maximum pagination limit (255 pages)");
                break;
            }
            page += 1;
        }

        info!("Found {} repositories", repositories.len());
        Ok(repositories)
    }

    /// Fetch the authenticated username for a token
    pub async fn username(&self, token: &str) -> Result<String> {
        let client = Self::build(token)?;

        let user = client
            .current()
            .user()
            .await
            .map_err(|e| EngineError::Auth(format!("failed to fetch user: {}", e)))?;

        Ok(user.login)
    }
}

#[async_trait]
impl TokenValidator for GitHubClient {
    async fn validate_token(&self, token: &str) -> AuthState {
        if token.trim().is_empty() {
            return AuthState::Invalid;
        }

        let client = match Self::build(token) {
            Ok(client) => client,
            Err(_) => return AuthState::Unknown,
        };

        match client.current().user().await {
            Ok(user) => {
                debug!("Token validated for {}", user.login);
                AuthState::Valid
            }
            Err(e) => {
                let state = Self::classify_error(&e);
                debug!("Token validation returned {:?}", state);
                state
            }
        }
    }
}
