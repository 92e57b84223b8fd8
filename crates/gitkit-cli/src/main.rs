//! gitkit - command-line front end for the gitkit repository-analysis backend.
//!
//! Signs in with GitHub, keeps the session's two tokens in sync, and prints
//! backend payloads as JSON.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gitkit_core::api::{GenerateDocsRequest, HealthQuery};
use gitkit_core::{
    ApiClient, ApiError, Config, CredentialBackend, FirebaseGithubProvider, Navigator, Notice,
    NoticeLevel, Notifier, RepoRef, SessionManager, SessionStatus,
};

/// Log file name in the cache directory
const LOG_FILE: &str = "gitkit.log";

/// Exit status when the command needs a fresh sign-in
const EXIT_SIGN_IN_REQUIRED: i32 = 2;

#[derive(Parser)]
#[command(name = "gitkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Also write logs to gitkit.log in the cache directory
    #[arg(long)]
    log_file: bool,

    /// Backend base URL
    #[arg(long, env = "GITKIT_API_BASE_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save identity provider and storage settings to the config file
    Config {
        /// Firebase Web API key
        #[arg(long)]
        firebase_api_key: Option<String>,

        /// GitHub OAuth app client id
        #[arg(long)]
        github_client_id: Option<String>,

        /// Where session tokens are stored (keyring or file)
        #[arg(long)]
        credential_backend: Option<CredentialBackend>,
    },

    /// Sign in with GitHub
    Login,

    /// Sign out and clear stored credentials
    Logout,

    /// Show the current session
    Status,

    /// Mint a fresh identity token
    Refresh,

    /// Show your GitHub profile
    Profile,

    /// List your repositories
    Repos,

    /// Show one repository
    Repo { repo: RepoRef },

    /// AI analysis of a repository
    Analysis { repo: RepoRef },

    /// Repository health score
    Health {
        repo: RepoRef,

        /// Include static code analysis
        #[arg(long)]
        analyze_code: bool,

        /// Include the detailed breakdown
        #[arg(long)]
        detailed: bool,
    },

    /// Dependencies of a repository
    Deps { repo: RepoRef },

    /// Commit activity of a repository
    Activity { repo: RepoRef },

    /// Generate documentation for a repository
    Docs {
        repo: RepoRef,

        /// Kind of document (readme, api, contributing, ...)
        #[arg(short = 't', long, default_value = "readme")]
        doc_type: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// GET an arbitrary backend path with the session's credentials
    Get { path: String },

    /// Profile and repositories together
    Dashboard,
}

/// Prints notices on stderr so stdout stays parseable.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => eprintln!("error: {}", notice.message),
            _ => eprintln!("{}", notice.message),
        }
    }
}

/// The CLI has no entry page; tell the user how to get back in.
struct CliNavigator;

impl Navigator for CliNavigator {
    fn navigate_to_entry(&self) {
        eprintln!("Run `gitkit login` to sign in.");
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct App {
    manager: Arc<SessionManager>,
    api: ApiClient,
}

impl App {
    async fn new(config: &Config) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = Arc::new(ConsoleNotifier);
        let (api_key, client_id) = config.provider_settings()?;
        let provider = FirebaseGithubProvider::new(
            api_key,
            client_id,
            config.cache_dir()?,
            notifier.clone(),
        )?;

        let manager = Arc::new(
            SessionManager::new(
                config.credential_store()?,
                Arc::new(provider),
                Arc::new(CliNavigator),
                notifier.clone(),
            )
            .with_scopes(config.scopes.clone()),
        );
        let api = ApiClient::from_config(config, manager.clone(), notifier)
            .context("Failed to build API client")?;

        let status = manager.initialize().await;
        debug!(?status, "Session initialized");

        Ok(Self { manager, api })
    }

    /// Refresh the identity token if it is about to expire, then keep it fresh
    /// for the duration of a long request.
    async fn ready(&self, config: &Config) -> Result<()> {
        if self.manager.status() == SessionStatus::Authenticated {
            self.manager.ensure_fresh().await?;
            self.manager.spawn_refresh_task(config.refresh_interval());
        }
        Ok(())
    }
}

async fn login(app: &App) -> Result<()> {
    tokio::select! {
        result = app.manager.sign_in() => {
            let principal = result?;
            info!(uid = %principal.uid, "Signed in");
            println!("Signed in as {}", principal.display_label());
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Login cancelled. Please try again.");
        }
    }
    Ok(())
}

fn print_status(app: &App) -> Result<()> {
    let session = app.manager.snapshot();
    let expires_in = session
        .is_authenticated()
        .then(|| session.minutes_until_expiry());
    print_json(&json!({
        "status": session.status,
        "principal": session.principal,
        "identity_token_expires_in_minutes": expires_in,
    }))
}

async fn generate_docs(
    app: &App,
    repo: &RepoRef,
    doc_type: String,
    output: Option<PathBuf>,
) -> Result<()> {
    let (repo_data, file_analysis) =
        futures::try_join!(app.api.fetch_repository(repo), app.api.analyze_for_docs(repo))?;
    let documentation = app
        .api
        .generate_docs(&GenerateDocsRequest {
            repo_data,
            doc_type,
            file_analysis: Some(file_analysis),
        })
        .await?;

    match output {
        Some(path) => {
            std::fs::write(&path, documentation)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{}", documentation),
    }
    Ok(())
}

/// Write the given settings to the config file, leaving environment overrides out.
fn save_settings(
    firebase_api_key: Option<String>,
    github_client_id: Option<String>,
    credential_backend: Option<CredentialBackend>,
) -> Result<()> {
    let path = Config::config_path()?;
    let mut config = Config::load_from(&path)?;
    if let Some(key) = firebase_api_key {
        config.firebase_api_key = Some(key);
    }
    if let Some(id) = github_client_id {
        config.github_client_id = Some(id);
    }
    if let Some(backend) = credential_backend {
        config.credential_backend = backend;
    }
    config.save()?;
    eprintln!("Saved {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match run(cli).await {
        Err(e)
            if e
                .downcast_ref::<ApiError>()
                .is_some_and(ApiError::is_auth_failure) =>
        {
            debug!(error = %e, "Command needs a fresh sign-in");
            std::process::exit(EXIT_SIGN_IN_REQUIRED);
        }
        result => result,
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Config {
        firebase_api_key,
        github_client_id,
        credential_backend,
    } = cli.command
    {
        return save_settings(firebase_api_key, github_client_id, credential_backend);
    }

    let mut config = Config::load()?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }

    let log_dir = if cli.log_file {
        let dir = config.cache_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Some(dir)
    } else {
        None
    };
    let _guard = init_tracing(log_dir);
    info!(api = %config.api_base_url, "gitkit starting");

    let app = App::new(&config).await?;

    match cli.command {
        Commands::Login => login(&app).await?,
        Commands::Logout => app.manager.sign_out().await,
        Commands::Status => print_status(&app)?,
        Commands::Refresh => {
            app.manager.refresh_identity().await?;
            print_status(&app)?;
        }
        command => {
            app.ready(&config).await?;
            run_query(&app, command).await?;
        }
    }

    Ok(())
}

async fn run_query(app: &App, command: Commands) -> Result<()> {
    let api = &app.api;
    let value = match command {
        Commands::Profile => api.fetch_profile().await?,
        Commands::Repos => api.fetch_repositories().await?,
        Commands::Repo { repo } => api.fetch_repository(&repo).await?,
        Commands::Analysis { repo } => api.fetch_analysis(&repo).await?,
        Commands::Health {
            repo,
            analyze_code,
            detailed,
        } => {
            api.fetch_health(
                &repo,
                HealthQuery {
                    analyze_code,
                    detailed,
                },
            )
            .await?
        }
        Commands::Deps { repo } => api.fetch_dependencies(&repo).await?,
        Commands::Activity { repo } => api.fetch_activity(&repo).await?,
        Commands::Docs {
            repo,
            doc_type,
            output,
        } => return generate_docs(app, &repo, doc_type, output).await,
        Commands::Get { path } => api.get(&path).await?,
        Commands::Dashboard => {
            let (profile, repositories) =
                futures::try_join!(api.fetch_profile(), api.fetch_repositories())?;
            json!({ "profile": profile, "repositories": repositories })
        }
        Commands::Config { .. }
        | Commands::Login
        | Commands::Logout
        | Commands::Status
        | Commands::Refresh => {
            anyhow::bail!("not a query command")
        }
    };
    print_json(&value)
}
