use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repomedic::profile::Profiles;
use repomedic::sync::SyncResult;
use repomedic::{
    Config, GitCli, GitHubClient, HealthStatus, NetworkProbe, ProfileStore, RepositoryProfile,
    SshValidator, SyncEngine, SyncJob, SyncOptions, TokenValidator, UserProfile,
};

#[derive(Parser)]
#[command(name = "repomedic")]
#[command(about = "Git repository synchronization and health engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a repository profile
    Add {
        /// Repository name (also the directory name under the base directory)
        name: String,

        /// Remote URL; omit with --from-github to look it up
        remote: Option<String>,

        /// Look the repository up via the user's GitHub account
        #[arg(long)]
        from_github: bool,

        /// Owning user profile
        #[arg(long)]
        user: Option<String>,

        /// Explicit local path (defaults to <base_directory>/<name>)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Remove a repository profile (local files are untouched)
    Remove {
        name: String,
    },

    /// List registered repositories and their last known health
    List {
        /// Show paths, remotes, and last sync times
        #[arg(long)]
        details: bool,
    },

    /// Sync repositories to convergence
    Sync {
        /// Repository names; all registered repositories when empty
        names: Vec<String>,

        /// Allow destructive repair (delete and re-clone broken trees)
        #[arg(long)]
        force: bool,

        /// Emit machine-readable JSON instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Probe repositories and report health without changing anything
    Health {
        /// Repository names; all registered repositories when empty
        names: Vec<String>,

        /// Emit machine-readable JSON instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Check the environment: git, ssh, network, authentication
    Doctor {
        /// Check specific component
        #[arg(value_enum)]
        component: Option<DoctorComponent>,
    },

    /// Manage user profiles
    User {
        #[command(subcommand)]
        user_command: UserCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a user profile
    Add {
        username: String,

        /// GitHub personal access token
        #[arg(long)]
        token: Option<String>,

        /// SSH key path (defaults to the configured key)
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// List registered users
    List,
}

#[derive(clap::ValueEnum, Clone, Copy, PartialEq)]
enum DoctorComponent {
    /// Check git installation
    Git,

    /// Check SSH key and handshake
    Ssh,

    /// Check network reachability of the git host
    Network,

    /// Check GitHub token validity
    Auth,

    /// Check all components
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Add {
            name,
            remote,
            from_github,
            user,
            path,
        } => cmd_add(name, remote, from_github, user, path, &config).await,
        Commands::Remove { name } => cmd_remove(name),
        Commands::List { details } => cmd_list(details),
        Commands::Sync { names, force, json } => cmd_sync(names, force, json, &config).await,
        Commands::Health { names, json } => cmd_health(names, json, &config).await,
        Commands::Doctor { component } => cmd_doctor(component, &config).await,
        Commands::User { user_command } => cmd_user(user_command, &config).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Wire the engine with its production collaborators
fn build_engine(config: &Config) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(
        config.clone(),
        Arc::new(GitCli::new(config.git_timeout())),
        Arc::new(NetworkProbe::new(config.ssh.port, config.probe_step_timeout())),
        Arc::new(SshValidator::new(config.handshake_timeout())),
        Arc::new(GitHubClient::new()),
    ))
}

/// Build sync jobs for the named repositories (all when `names` is empty),
/// resolving each profile's owning user for its token and key
fn build_jobs(profiles: &Profiles, names: &[String]) -> Result<Vec<SyncJob>> {
    let selected: Vec<&RepositoryProfile> = if names.is_empty() {
        profiles.repositories.iter().collect()
    } else {
        names
            .iter()
            .map(|name| {
                profiles
                    .repository_by_name(name)
                    .ok_or_else(|| anyhow!("Unknown repository: {}", name))
            })
            .collect::<Result<_>>()?
    };

    Ok(selected
        .into_iter()
        .map(|repo| {
            let user = repo.user_id.and_then(|id| profiles.user(id));
            SyncJob {
                profile: repo.clone(),
                token: user.and_then(|u| u.token.clone()),
                key_path: user.map(|u| u.ssh_key_path.clone()),
            }
        })
        .collect())
}

fn health_icon(health: HealthStatus) -> &'static str {
    match health {
        HealthStatus::Healthy => "✅",
        HealthStatus::Unknown => "❔",
        HealthStatus::Missing => "📥",
        _ => "⚠️ ",
    }
}

fn result_json(result: &SyncResult) -> serde_json::Value {
    serde_json::json!({
        "id": result.profile.id,
        "name": result.profile.name,
        "path": result.profile.local_path,
        "prior_health": result.prior_health,
        "health": result.profile.health,
        "action": result.action.map(|a| a.to_string()),
        "attempts": result.attempts,
        "error": result.error,
        "duration_ms": result.duration.as_millis() as u64,
        "last_sync": result.profile.last_sync,
    })
}

/// Register a repository profile
async fn cmd_add(
    name: String,
    remote: Option<String>,
    from_github: bool,
    user: Option<String>,
    path: Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let store = ProfileStore::open_default()?;
    let mut profiles = store.load()?;

    if profiles.repository_by_name(&name).is_some() {
        bail!("Repository '{}' is already registered", name);
    }

    let owner = match &user {
        Some(username) => Some(
            profiles
                .user_by_name(username)
                .ok_or_else(|| anyhow!("Unknown user: {}", username))?
                .clone(),
        ),
        None => None,
    };

    let (remote_url, default_branch, pushed_at) = if from_github {
        let token = owner
            .as_ref()
            .and_then(|u| u.token.clone())
            .ok_or_else(|| anyhow!("--from-github requires --user with a stored token"))?;

        println!("🔍 Looking up {} on GitHub...", name);
        let client = GitHubClient::new();
        let repos = client.list_repos(&token).await?;
        let found = repos
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| anyhow!("No repository named '{}' visible to the token", name))?;

        let url = found
            .ssh_url
            .ok_or_else(|| anyhow!("GitHub returned no SSH URL for '{}'", name))?;
        (url, found.default_branch, found.pushed_at)
    } else {
        let url = remote.ok_or_else(|| anyhow!("A remote URL is required without --from-github"))?;
        (url, None, None)
    };

    let local_path = path.unwrap_or_else(|| PathBuf::from(&config.base_directory).join(&name));

    let mut profile = RepositoryProfile::new(&name, local_path, remote_url);
    profile.default_branch = default_branch;
    profile.pushed_at = pushed_at;
    if let Some(owner) = owner {
        profile = profile.with_user(owner.id);
    }

    println!("✅ Registered '{}'", profile.name);
    println!("   Path:   {}", profile.local_path.display());
    println!("   Remote: {}", profile.remote_url);

    profiles.upsert_repository(profile);
    store.save(&profiles)?;

    Ok(())
}

/// Remove a repository profile; the working tree stays on disk
fn cmd_remove(name: String) -> Result<()> {
    let store = ProfileStore::open_default()?;
    let mut profiles = store.load()?;

    let id = profiles
        .repository_by_name(&name)
        .map(|r| r.id)
        .ok_or_else(|| anyhow!("Unknown repository: {}", name))?;

    let removed = profiles.remove_repository(id).expect("id was just looked up");
    store.save(&profiles)?;

    println!("✅ Removed '{}' (files at {} untouched)", removed.name, removed.local_path.display());
    Ok(())
}

/// List registered repositories
fn cmd_list(details: bool) -> Result<()> {
    let store = ProfileStore::open_default()?;
    let profiles = store.load()?;

    if profiles.repositories.is_empty() {
        println!("No repositories registered. Add one with 'repomedic add'.");
        return Ok(());
    }

    println!("📋 {} registered repositories:", profiles.repositories.len());
    for repo in &profiles.repositories {
        println!("   {} {} ({})", health_icon(repo.health), repo.name, repo.health);

        if details {
            println!("      Path:   {}", repo.local_path.display());
            println!("      Remote: {}", repo.remote_url);
            if let Some(user) = repo.user_id.and_then(|id| profiles.user(id)) {
                println!("      User:   {}", user.username);
            }
            match repo.last_sync {
                Some(at) => println!("      Synced: {}", at.to_rfc3339()),
                None => println!("      Synced: never"),
            }
        }
    }

    Ok(())
}

/// Sync the named repositories (or all of them)
async fn cmd_sync(names: Vec<String>, force: bool, json: bool, config: &Config) -> Result<()> {
    let store = ProfileStore::open_default()?;
    let mut profiles = store.load()?;

    let jobs = build_jobs(&profiles, &names)?;
    if jobs.is_empty() {
        println!("No repositories registered. Add one with 'repomedic add'.");
        return Ok(());
    }

    let engine = build_engine(config);

    // Ctrl-C stops the engine at the next step boundary
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Cancellation requested, finishing in-flight operations");
            cancel.cancel();
        }
    });

    if !json {
        println!("🔄 Syncing {} repositories...", jobs.len());
    }

    let options = SyncOptions {
        confirm_destructive: force || config.sync.confirm_destructive,
    };
    let summary = engine.sync_all(jobs, options).await;

    // Persist the derived health and sync timestamps
    for result in &summary.results {
        profiles.upsert_repository(result.profile.clone());
    }
    store.save(&profiles)?;

    if json {
        let entries: Vec<_> = summary.results.iter().map(result_json).collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for result in &summary.results {
            let line = format!(
                "   {} {} ({})",
                health_icon(result.profile.health),
                result.profile.name,
                result.profile.health
            );
            match &result.error {
                Some(error) => println!("{}: {}", line, error),
                None => println!("{}", line),
            }
        }

        println!("\n📈 Summary:");
        println!("   ✅ Healthy: {}", summary.healthy());
        println!("   ⚠️  Needs attention: {}", summary.results.len() - summary.healthy());
        if summary.failed() > 0 {
            println!("   ❌ Failed: {}", summary.failed());
        }
    }

    if !summary.all_ok() {
        std::process::exit(1);
    }
    Ok(())
}

/// Probe and report without changing anything
async fn cmd_health(names: Vec<String>, json: bool, config: &Config) -> Result<()> {
    let store = ProfileStore::open_default()?;
    let mut profiles = store.load()?;

    let jobs = build_jobs(&profiles, &names)?;
    if jobs.is_empty() {
        println!("No repositories registered. Add one with 'repomedic add'.");
        return Ok(());
    }

    let engine = build_engine(config);
    let results = engine.check_health_all(jobs).await;

    for result in &results {
        profiles.upsert_repository(result.profile.clone());
    }
    store.save(&profiles)?;

    if json {
        let entries: Vec<_> = results.iter().map(result_json).collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("🩺 Health report:");
        for result in &results {
            println!(
                "   {} {} ({}): {}",
                health_icon(result.profile.health),
                result.profile.name,
                result.profile.health,
                result.profile.health.reason()
            );
        }
    }

    Ok(())
}

/// Environment diagnostics
async fn cmd_doctor(component: Option<DoctorComponent>, config: &Config) -> Result<()> {
    let component = component.unwrap_or(DoctorComponent::All);
    let all = component == DoctorComponent::All;
    let mut failures = 0;

    println!("🩺 repomedic doctor\n");

    if all || component == DoctorComponent::Git {
        match tokio::process::Command::new("git").arg("--version").output().await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                println!("✅ git: {}", version.trim());
            }
            _ => {
                println!("❌ git: not found on PATH");
                failures += 1;
            }
        }
    }

    if all || component == DoctorComponent::Network {
        use repomedic::net::ConnectivityProbe;
        use repomedic::NetState;

        let probe = NetworkProbe::new(config.ssh.port, config.probe_step_timeout());
        match probe.probe(&config.ssh.host).await {
            NetState::Reachable => {
                println!("✅ network: {}:{} reachable", config.ssh.host, config.ssh.port)
            }
            NetState::DnsFailure => {
                println!("❌ network: {} does not resolve", config.ssh.host);
                failures += 1;
            }
            NetState::TcpUnreachable => {
                println!(
                    "❌ network: no TCP connection to {}:{}",
                    config.ssh.host, config.ssh.port
                );
                failures += 1;
            }
        }
    }

    if all || component == DoctorComponent::Ssh {
        use repomedic::ssh::SshCheck;
        use repomedic::SshState;

        let validator = SshValidator::new(config.handshake_timeout());
        let key_path = PathBuf::from(&config.ssh.key_path);
        match validator.validate(&key_path, &config.ssh.host).await {
            SshState::Valid => println!("✅ ssh: handshake with {} succeeded", config.ssh.host),
            state => {
                println!("❌ ssh: {:?} (key: {})", state, key_path.display());
                failures += 1;
            }
        }
    }

    if all || component == DoctorComponent::Auth {
        use repomedic::AuthState;

        let store = ProfileStore::open_default()?;
        let profiles = store.load()?;
        let tokens: Vec<&UserProfile> = profiles
            .users
            .iter()
            .filter(|u| u.token.is_some())
            .collect();

        if tokens.is_empty() {
            println!("❔ auth: no users with stored tokens");
        } else {
            let client = GitHubClient::new();
            for user in tokens {
                let token = user.token.as_deref().unwrap_or_default();
                match client.validate_token(token).await {
                    AuthState::Valid => println!("✅ auth: token for {} is valid", user.username),
                    state => {
                        println!("❌ auth: token for {} is {:?}", user.username, state);
                        failures += 1;
                    }
                }
            }
        }
    }

    if failures > 0 {
        println!("\n⚠️  {} check(s) failed", failures);
        std::process::exit(1);
    }

    println!("\n✅ All checks passed");
    Ok(())
}

/// User profile management
async fn cmd_user(user_command: UserCommands, config: &Config) -> Result<()> {
    let store = ProfileStore::open_default()?;
    let mut profiles = store.load()?;

    match user_command {
        UserCommands::Add {
            username,
            token,
            key,
        } => {
            if profiles.user_by_name(&username).is_some() {
                bail!("User '{}' is already registered", username);
            }

            if let Some(token) = &token {
                print!("🔍 Validating token... ");
                let client = GitHubClient::new();
                let login = client.username(token).await?;
                println!("ok ({})", login);
            }

            let key_path = key.unwrap_or_else(|| PathBuf::from(&config.ssh.key_path));
            let mut user = UserProfile::new(&username, key_path);
            user.token = token;

            println!("✅ Registered user '{}'", user.username);
            profiles.users.push(user);
            store.save(&profiles)?;
        }
        UserCommands::List => {
            if profiles.users.is_empty() {
                println!("No users registered.");
            } else {
                println!("👤 {} registered users:", profiles.users.len());
                for user in &profiles.users {
                    let token = if user.token.is_some() { "token stored" } else { "no token" };
                    println!("   {} ({}, key: {})", user.username, token, user.ssh_key_path.display());
                }
            }
        }
    }

    Ok(())
}
