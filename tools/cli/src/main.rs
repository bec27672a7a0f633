//! MusicHub CLI - Command line front end for the offline sync core.
//!
//! Signs in against the MusicHub API, keeps the session across restarts and
//! runs sync rounds on demand or on a schedule.

mod config;
mod services;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use musichub_auth::{AuthUser, OAuthProvider};
use musichub_sync::{SyncOptions, SyncResult, SyncScheduler};

use crate::config::{resolve_data_dir, CoreConfig};
use crate::services::Services;

#[derive(Parser)]
#[command(name = "musichub")]
#[command(about = "MusicHub - Offline-first sync client")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the local databases and config.json.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password.
    Login {
        #[arg(short, long)]
        email: String,
    },

    /// Create an account.
    Signup {
        #[arg(short, long)]
        email: String,

        /// Display name.
        #[arg(short, long)]
        name: String,
    },

    /// Print the provider authorization URL.
    ProviderUrl {
        /// "google" or "apple".
        #[arg(short, long)]
        provider: OAuthProvider,
    },

    /// Sign in through Google or Apple in the browser.
    ProviderLogin {
        /// "google" or "apple".
        #[arg(short, long)]
        provider: OAuthProvider,

        /// Print the URL instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },

    /// Sign out and forget the stored session.
    Logout,

    /// Show session and sync status.
    Status,

    /// Run one sync round.
    Sync {
        /// Sync even when the device looks offline.
        #[arg(short, long)]
        force: bool,

        /// Only pull these tables (comma separated).
        #[arg(short, long, value_delimiter = ',')]
        relations: Vec<String>,
    },

    /// Keep syncing in the background until interrupted.
    Run {
        /// Periodic sync interval in seconds.
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Mark onboarding as done for the signed-in user.
    CompleteOnboarding,

    /// Send a password reset email.
    ResetPassword {
        #[arg(short, long)]
        email: String,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "musichub", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = resolve_data_dir(cli.data_dir)?;
    let config = CoreConfig::load(&data_dir)?;
    let services = Services::open(&data_dir, config).await?;

    match cli.command {
        Commands::Login { email } => cmd_login(&services, &email).await,
        Commands::Signup { email, name } => cmd_signup(&services, &email, &name).await,
        Commands::ProviderUrl { provider } => cmd_provider_url(&services, provider),
        Commands::ProviderLogin {
            provider,
            no_browser,
        } => cmd_provider_login(&services, provider, no_browser).await,
        Commands::Logout => cmd_logout(&services).await,
        Commands::Status => cmd_status(&services).await,
        Commands::Sync { force, relations } => cmd_sync(&services, force, relations).await,
        Commands::Run { interval } => cmd_run(&services, interval).await,
        Commands::CompleteOnboarding => cmd_complete_onboarding(&services).await,
        Commands::ResetPassword { email } => cmd_reset_password(&services, &email).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read password")
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read input")?;
    Ok(line.trim().to_string())
}

fn print_user(user: &AuthUser) {
    println!("  ID: {}", user.id);
    println!("  Email: {}", user.email);
    println!("  Name: {}", user.name);
    println!("  Role: {:?}", user.role);
    println!("  Onboarded: {}", user.has_completed_onboarding);
}

fn print_result(result: &SyncResult) {
    match &result.error {
        None => println!(
            "Sync completed: {} pulled, {} pushed",
            result.pulled, result.pushed
        ),
        Some(failure) => println!("Sync failed: {}", failure),
    }
}

async fn cmd_login(services: &Services, email: &str) -> Result<()> {
    let password = prompt_password("Password: ")?;
    let user = services
        .session
        .sign_in(email, &password)
        .await
        .context("Sign-in failed")?;

    let state = services.session.state().await;
    println!("Signed in ({})", state.as_str());
    print_user(&user);
    Ok(())
}

async fn cmd_signup(services: &Services, email: &str, name: &str) -> Result<()> {
    let password = prompt_password("Password: ")?;
    let confirm = prompt_password("Confirm password: ")?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let user = services
        .session
        .sign_up(email, &password, name)
        .await
        .context("Sign-up failed")?;

    println!("Account created!");
    print_user(&user);
    Ok(())
}

fn cmd_provider_url(services: &Services, provider: OAuthProvider) -> Result<()> {
    let authorization = services
        .session
        .provider_authorization(provider)
        .with_context(|| format!("Cannot start {} sign-in", provider))?;
    println!("{}", authorization.url);
    Ok(())
}

async fn cmd_provider_login(
    services: &Services,
    provider: OAuthProvider,
    no_browser: bool,
) -> Result<()> {
    let authorization = services
        .session
        .provider_authorization(provider)
        .with_context(|| format!("Cannot start {} sign-in", provider))?;

    if no_browser {
        println!("Open this URL to continue:\n{}", authorization.url);
    } else if let Err(e) = open::that(&authorization.url) {
        warn!("Could not open a browser: {}", e);
        println!("Open this URL to continue:\n{}", authorization.url);
    }

    let redirect = prompt_line("Paste the URL you were redirected to: ")?;
    let redirect = Url::parse(&redirect).context("Invalid redirect URL")?;
    let param = |name: &str| {
        redirect
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };
    let code = param("code").context("Redirect URL has no code")?;
    let state = param("state").context("Redirect URL has no state")?;
    let grant = authorization.grant(code, &state, param("id_token"))?;

    let user = services
        .session
        .sign_in_with_provider(provider, &grant)
        .await
        .with_context(|| format!("{} sign-in failed", provider))?;

    println!("Signed in with {}", provider);
    print_user(&user);
    Ok(())
}

async fn cmd_logout(services: &Services) -> Result<()> {
    services.session.sign_out().await.context("Sign-out failed")?;
    println!("Signed out.");
    Ok(())
}

async fn cmd_status(services: &Services) -> Result<()> {
    let snapshot = services.session.snapshot().await;
    let online = services.connectivity.is_online().await;
    let pending = services.store.pending_changes()?;
    let last_synced = services.engine.cursor().last_synced_at().await?;

    println!("Session:");
    println!("  State: {}", snapshot.state.as_str());
    if let Some(user) = &snapshot.user {
        println!("  User: {} <{}>", user.name, user.email);
    }
    if let Some(at) = snapshot.last_synced_auth_at {
        println!("  Last server login: {}", at);
    }
    if let Some(at) = snapshot.offline_access_expires_at {
        println!("  Offline access until: {}", at);
    }
    println!("Sync:");
    println!("  Online: {}", online);
    println!("  Pending records: {}", pending.changes.record_count());
    match last_synced {
        Some(at) => println!("  Last synced: {}", at),
        None => println!("  Last synced: never"),
    }
    Ok(())
}

async fn cmd_sync(services: &Services, force: bool, relations: Vec<String>) -> Result<()> {
    let mut options = SyncOptions::default().with_progress(|fraction| {
        info!("Sync progress: {:.0}%", fraction * 100.0);
    });
    options.force = force;
    if !relations.is_empty() {
        options = options.with_relations(relations);
    }

    let result = services.engine.sync(options).await.context("Sync aborted")?;
    print_result(&result);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Interval at which the connectivity probe is polled in `run`.
const CONNECTIVITY_POLL: Duration = Duration::from_secs(30);

async fn cmd_run(services: &Services, interval: Option<u64>) -> Result<()> {
    let mut config = services.config.scheduler.clone();
    if let Some(secs) = interval {
        config = config.with_interval(Duration::from_secs(secs));
    }

    let (scheduler, handle) = SyncScheduler::new(services.engine.clone(), config).await?;
    let task = tokio::spawn(handle.run());

    let watcher = {
        let scheduler: Arc<SyncScheduler> = scheduler.clone();
        let connectivity = services.connectivity.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONNECTIVITY_POLL);
            loop {
                ticker.tick().await;
                let online = connectivity.is_online().await;
                if scheduler.connectivity_changed(online).await.is_err() {
                    break;
                }
            }
        })
    };

    println!("Syncing in the background. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping");
    watcher.abort();
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;

    if let Some(result) = scheduler.last_sync_result().await {
        print_result(&result);
    }
    Ok(())
}

async fn cmd_complete_onboarding(services: &Services) -> Result<()> {
    let user = services
        .session
        .complete_onboarding()
        .await
        .context("Could not complete onboarding")?;
    println!("Onboarding completed for {}", user.email);
    Ok(())
}

async fn cmd_reset_password(services: &Services, email: &str) -> Result<()> {
    services
        .session
        .reset_password(email)
        .await
        .context("Password reset failed")?;
    println!("If an account exists for {}, a reset email is on its way.", email);
    Ok(())
}
