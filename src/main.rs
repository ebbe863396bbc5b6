use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sprintgate::auth::{ApiKeyGenerator, SecretHasher};
use sprintgate::config::ServerConfig;
use sprintgate::server::{AppState, create_router};
use sprintgate::server::validation::{
    key_expiry, validate_email, validate_key_name, validate_password,
};
use sprintgate::store::{SqliteStore, Store};
use sprintgate::types::{NewApiCredential, TeamMemberStatus, User};

#[derive(Parser)]
#[command(name = "sprintgate")]
#[command(about = "Authentication and access control service for project workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to
    #[arg(long, short, default_value = "8080")]
    port: u16,

    /// Data directory for the database
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// HMAC secret for session tokens (at least 32 bytes)
    #[arg(long, env = "SPRINTGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Session token lifetime in hours
    #[arg(long, default_value = "24")]
    jwt_expiry_hours: u64,

    /// Burst capacity of the per-client rate limiter
    #[arg(long, default_value = "100")]
    rate_limit: u32,

    /// Tokens added per second to each bucket
    #[arg(long, default_value = "1.0")]
    rate_limit_refill: f64,

    /// Burst capacity of the signup/login rate limiter
    #[arg(long, default_value = "20")]
    auth_rate_limit: u32,

    /// Upper bound on a single database call, in milliseconds
    #[arg(long, default_value = "5000")]
    store_timeout_ms: u64,

    /// Issuer shown in authenticator apps
    #[arg(long, default_value = "SprintGate")]
    totp_issuer: String,

    /// Derive the rate-limit key from X-Real-IP / X-Forwarded-For.
    /// Disable unless a trusted proxy overwrites both headers.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    trust_proxy_headers: bool,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Initialize the server (create the database)
    Init {
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },

    /// Create a user account
    CreateUser {
        #[arg(long, default_value = "./data")]
        data_dir: String,

        #[arg(long)]
        email: String,

        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Create a team owned by an existing user
    CreateTeam {
        #[arg(long, default_value = "./data")]
        data_dir: String,

        #[arg(long)]
        name: String,

        /// Email of the owning user
        #[arg(long)]
        owner: String,
    },

    /// Add a user to a team as an active member
    AddTeamMember {
        #[arg(long, default_value = "./data")]
        data_dir: String,

        #[arg(long)]
        team_id: i64,

        #[arg(long)]
        email: String,
    },

    /// Create a project inside a team
    CreateProject {
        #[arg(long, default_value = "./data")]
        data_dir: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        team_id: i64,

        /// Email of the creating user
        #[arg(long)]
        owner: String,
    },

    /// Issue an API key for a user and print it once
    IssueKey {
        #[arg(long, default_value = "./data")]
        data_dir: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,

        /// Lifetime in days (1-365); never expires when omitted
        #[arg(long)]
        expires_in: Option<i64>,
    },
}

fn db_path(data_dir: &str) -> PathBuf {
    ServerConfig {
        data_dir: data_dir.into(),
        ..ServerConfig::default()
    }
    .db_path()
}

/// Opens an existing database, refusing to create one implicitly.
fn open_store(data_dir: &str) -> anyhow::Result<SqliteStore> {
    let path = db_path(data_dir);
    if !path.exists() {
        bail!("Server not initialized. Run 'sprintgate admin init' first to create the database.");
    }
    let store = SqliteStore::new(&path)?;
    store.initialize()?;
    Ok(store)
}

fn find_user(store: &SqliteStore, email: &str) -> anyhow::Result<User> {
    store
        .get_user_by_email(&email.trim().to_lowercase())?
        .with_context(|| format!("no user with email '{email}'"))
}

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

fn run_init(data_dir: &str) -> anyhow::Result<()> {
    fs::create_dir_all(data_dir)?;

    let path = db_path(data_dir);
    if path.exists() {
        bail!("Server already initialized. Database exists at: {}", path.display());
    }

    let store = SqliteStore::new(&path)?;
    store.initialize()?;

    #[cfg(unix)]
    set_restrictive_permissions(&path);

    println!("Initialized database at {}", path.display());
    Ok(())
}

fn run_admin(command: AdminCommands) -> anyhow::Result<()> {
    match command {
        AdminCommands::Init { data_dir } => run_init(&data_dir)?,

        AdminCommands::CreateUser {
            data_dir,
            email,
            password,
        } => {
            let store = open_store(&data_dir)?;
            let email = email.trim().to_lowercase();
            validate_email(&email).map_err(|e| anyhow::anyhow!(e.message))?;

            let password = match password {
                Some(p) => p,
                None => inquire::Password::new("Password:")
                    .with_display_mode(inquire::PasswordDisplayMode::Masked)
                    .prompt()?,
            };
            validate_password(&password).map_err(|e| anyhow::anyhow!(e.message))?;

            let hash = SecretHasher::new().hash(&password)?;
            let user = store
                .create_user(&email, &hash)
                .with_context(|| format!("failed to create user '{email}'"))?;

            println!("Created user {} ({})", user.id, user.email);
        }

        AdminCommands::CreateTeam {
            data_dir,
            name,
            owner,
        } => {
            let store = open_store(&data_dir)?;
            let owner = find_user(&store, &owner)?;
            let team = store.create_team(name.trim(), owner.id)?;

            println!("Created team {} ({})", team.id, team.name);
        }

        AdminCommands::AddTeamMember {
            data_dir,
            team_id,
            email,
        } => {
            let store = open_store(&data_dir)?;
            let user = find_user(&store, &email)?;
            store.set_team_member(team_id, user.id, TeamMemberStatus::Active)?;

            println!("Added {} to team {team_id}", user.email);
        }

        AdminCommands::CreateProject {
            data_dir,
            name,
            team_id,
            owner,
        } => {
            let store = open_store(&data_dir)?;
            let owner = find_user(&store, &owner)?;
            let project = store.create_project(owner.id, team_id, name.trim())?;

            println!("Created project {} ({})", project.id, project.name);
        }

        AdminCommands::IssueKey {
            data_dir,
            email,
            name,
            expires_in,
        } => {
            let store = open_store(&data_dir)?;
            let user = find_user(&store, &email)?;
            validate_key_name(&name).map_err(|e| anyhow::anyhow!(e.message))?;
            let expires_at =
                key_expiry(expires_in, Utc::now()).map_err(|e| anyhow::anyhow!(e.message))?;

            let key = ApiKeyGenerator::new().generate();
            store.create_api_credential(&NewApiCredential {
                owner_user_id: user.id,
                name: name.trim().to_string(),
                key_hash: key.digest,
                key_prefix: key.prefix,
                expires_at,
            })?;

            println!();
            println!("========================================");
            println!("API key for {} (save this, it won't be shown again):", user.email);
            println!();
            println!("  {}", key.raw);
            println!();
            println!("========================================");
            println!();
        }
    }

    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        data_dir: args.data_dir.into(),
        jwt_secret: args.jwt_secret,
        jwt_expiry: Duration::from_secs(args.jwt_expiry_hours.saturating_mul(3600)),
        rate_limit: args.rate_limit,
        auth_rate_limit: args.auth_rate_limit,
        rate_limit_refill_per_sec: args.rate_limit_refill,
        trust_proxy_headers: args.trust_proxy_headers,
        store_timeout: Duration::from_millis(args.store_timeout_ms),
        totp_issuer: args.totp_issuer,
    };
    config.validate()?;

    if !config.db_path().exists() {
        bail!("Server not initialized. Run 'sprintgate admin init' first to create the database.");
    }
    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;

    if !config.trust_proxy_headers {
        info!("Proxy headers ignored; rate limiting by socket peer address");
    }

    let addr = config.socket_addr()?;
    let state = Arc::new(AppState::new(Arc::new(store), config));
    let reapers = [
        state.limiter.start_cleanup_task(),
        state.auth_limiter.start_cleanup_task(),
    ];

    let app = create_router(state);

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for reaper in reapers {
        reaper.abort();
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sprintgate=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => run_admin(command)?,
        Commands::Serve(args) => run_serve(args).await?,
    }

    Ok(())
}
