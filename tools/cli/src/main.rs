//! TarotSync CLI - command line access to daily sessions and spreads.
//!
//! Every invocation builds the full storage stack: local file storage, the
//! remote adapter and the router between them. Signing in migrates local
//! data to the server; later invocations resume the saved session.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use tarotsync_common::{AuthState, Credentials, Memos, SessionDate, SpreadRecord, UserInfo};
use tarotsync_storage::{
    ClientConfig, FileStore, LocalAdapter, RegisterRequest, RemoteStorageAdapter, ReqwestBackend,
    StorageProvider, TokenAuthority, TransportClient,
};
use tarotsync_sync::StorageRouter;

const CONFIG_FILE: &str = "config.json";
const SESSION_FILE: &str = "session.json";

#[derive(Parser)]
#[command(name = "tarotsync")]
#[command(about = "TarotSync - daily tarot sessions and spreads, offline or synced")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding configuration, session and local data.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the API base URL from config.json.
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and migrate local data to the server.
    Login {
        #[arg(short, long)]
        email: String,
    },

    /// Create an account and sign in.
    Register {
        #[arg(short, long)]
        email: String,

        /// Display name.
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Sign out; later commands use local storage.
    Logout,

    /// Show the signed-in account.
    Whoami,

    /// Daily session commands.
    #[command(subcommand)]
    Session(SessionCommands),

    /// Spread commands.
    #[command(subcommand)]
    Spread(SpreadCommands),

    /// Show router phase, connectivity and server record counts.
    Status,

    /// Export all server-side data as JSON.
    Export {
        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Print the session for a day.
    Get {
        /// Day as YYYY-MM-DD (default: today).
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Set the memo for one hour of a day.
    SaveMemo {
        /// Day as YYYY-MM-DD (default: today).
        #[arg(short, long)]
        date: Option<String>,

        /// Hour of the day (0-23).
        #[arg(long)]
        hour: u8,

        /// Memo text.
        #[arg(short, long)]
        text: String,
    },
}

#[derive(Subcommand)]
enum SpreadCommands {
    /// List saved spreads.
    List,

    /// Save a new spread.
    Add {
        #[arg(short, long)]
        title: String,

        /// Spread layout, e.g. "three-card".
        #[arg(short = 'k', long, default_value = "three-card")]
        spread_type: String,

        /// Free-form notes.
        #[arg(short, long, default_value = "")]
        insights: String,
    },

    /// Delete a spread by id.
    Delete {
        #[arg(short, long)]
        id: String,
    },
}

/// Credentials persisted between invocations.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredSession {
    #[zeroize(skip)]
    user: UserInfo,
    access_token: String,
    refresh_token: String,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl StoredSession {
    fn from_state(state: &AuthState) -> Option<Self> {
        match state {
            AuthState::Authenticated { credentials, user } => Some(Self {
                user: user.clone(),
                access_token: credentials.access_token().to_string(),
                refresh_token: credentials.refresh_token().to_string(),
                expires_at: credentials.expires_at(),
            }),
            AuthState::LoggedOut => None,
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(
            self.access_token.as_str(),
            self.refresh_token.as_str(),
            self.expires_at,
        )
    }
}

/// The assembled storage stack for one invocation.
struct App {
    data_dir: PathBuf,
    config: ClientConfig,
    authority: Arc<TokenAuthority>,
    router: Arc<StorageRouter>,
}

impl App {
    async fn open(data_dir: PathBuf, api_url: Option<String>) -> Result<Self> {
        let mut config = load_config(&data_dir).await?;
        if let Some(url) = api_url {
            config.api_base_url = url;
        }
        let config = config.validated().context("Invalid client configuration")?;

        let backend = Arc::new(
            ReqwestBackend::new(&config.user_agent).context("Failed to create HTTP client")?,
        );
        let authority = TokenAuthority::new(config.clone(), backend)
            .context("Failed to create token authority")?;
        let transport = Arc::new(TransportClient::new(authority.clone()));
        let remote = Arc::new(RemoteStorageAdapter::new(transport));

        let store =
            FileStore::new(data_dir.join("local")).context("Failed to open local storage")?;
        let local = Arc::new(LocalAdapter::new(store));
        let router = Arc::new(StorageRouter::new(local, remote));

        let app = Self {
            data_dir,
            config,
            authority,
            router,
        };
        app.resume().await?;
        Ok(app)
    }

    /// Restore a saved session, skipping migration.
    async fn resume(&self) -> Result<()> {
        let path = self.data_dir.join(SESSION_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .context("Failed to read saved session")?;
        let stored: StoredSession = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Ignoring unreadable saved session: {}", e);
                return Ok(());
            }
        };

        self.authority
            .restore_session(stored.user.clone(), stored.credentials());
        self.router
            .resume_session(&self.authority.auth_state())
            .await;
        Ok(())
    }

    /// Persist the current session, or remove it when signed out.
    async fn save_session(&self) -> Result<()> {
        let path = self.data_dir.join(SESSION_FILE);

        match StoredSession::from_state(&self.authority.auth_state()) {
            Some(stored) => {
                let raw = Zeroizing::new(serde_json::to_string_pretty(&stored)?);
                write_private(&path, raw.as_bytes())
                    .await
                    .context("Failed to save session")?;
            }
            None => {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    tokio::fs::remove_file(&path)
                        .await
                        .context("Failed to remove saved session")?;
                }
            }
        }
        Ok(())
    }

    /// Bound a storage write: the offline queue only lives as long as this process.
    async fn write<F>(&self, operation: F) -> Result<()>
    where
        F: Future<Output = tarotsync_common::Result<()>>,
    {
        let limit = self.config.request_timeout() * 2;
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result.context("Write failed"),
            Err(_) => anyhow::bail!("Server unreachable; write was not saved"),
        }
    }

    fn require_signed_in(&self) -> Result<()> {
        if !self.authority.is_authenticated() {
            anyhow::bail!("Not signed in. Run `tarotsync login --email <EMAIL>` first");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let app = App::open(data_dir, cli.api_url).await?;

    let result = match cli.command {
        Commands::Login { email } => cmd_login(&app, &email).await,
        Commands::Register { email, name } => cmd_register(&app, &email, name).await,
        Commands::Logout => cmd_logout(&app).await,
        Commands::Whoami => cmd_whoami(&app).await,
        Commands::Session(SessionCommands::Get { date }) => cmd_session_get(&app, date).await,
        Commands::Session(SessionCommands::SaveMemo { date, hour, text }) => {
            cmd_save_memo(&app, date, hour, text).await
        }
        Commands::Spread(SpreadCommands::List) => cmd_spread_list(&app).await,
        Commands::Spread(SpreadCommands::Add {
            title,
            spread_type,
            insights,
        }) => cmd_spread_add(&app, title, spread_type, insights).await,
        Commands::Spread(SpreadCommands::Delete { id }) => cmd_spread_delete(&app, &id).await,
        Commands::Status => cmd_status(&app).await,
        Commands::Export { output } => cmd_export(&app, output.as_deref()).await,
    };

    // tokens may have been refreshed, or the session ended
    app.save_session().await?;
    result
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not determine the data directory")?;
    Ok(base.join("tarotsync"))
}

/// Read `config.json`, writing the defaults on first use.
async fn load_config(data_dir: &Path) -> Result<ClientConfig> {
    let path = data_dir.join(CONFIG_FILE);

    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path.display()));
    }

    let config = ClientConfig::default();
    let raw = serde_json::to_string_pretty(&config)?;
    tokio::fs::write(&path, raw)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote default configuration to {}", path.display());
    Ok(config)
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

fn parse_date(date: Option<String>) -> Result<SessionDate> {
    match date {
        Some(date) => SessionDate::parse(&date).context("Invalid date"),
        None => Ok(SessionDate::today()),
    }
}

/// Move the router onto the new session and report the migration.
async fn finish_sign_in(app: &App) -> Result<()> {
    let report = app
        .router
        .update_auth_state(&app.authority.auth_state())
        .await;

    if let Some(report) = report {
        println!(
            "Migrated {} spread(s) and {} session(s) to the server.",
            report.migrated_spreads, report.migrated_sessions
        );
        for failure in &report.failures {
            println!("  Failed {} {}: {}", failure.kind, failure.key, failure.reason);
        }
    }
    Ok(())
}

async fn cmd_login(app: &App, email: &str) -> Result<()> {
    if app.authority.is_authenticated() {
        anyhow::bail!("Already signed in. Run `tarotsync logout` first");
    }

    let password = prompt_password("Password: ")?;
    let (user, _) = app
        .authority
        .login(email, &password)
        .await
        .context("Login failed")?;

    println!("Signed in as {}", user.email);
    finish_sign_in(app).await
}

async fn cmd_register(app: &App, email: &str, name: Option<String>) -> Result<()> {
    if app.authority.is_authenticated() {
        anyhow::bail!("Already signed in. Run `tarotsync logout` first");
    }

    let password = prompt_password("Password: ")?;
    let confirm = prompt_password("Confirm password: ")?;
    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let mut request = RegisterRequest::new(email, password.as_str());
    request.name = name;
    let result = app.authority.register(&request).await;
    request.password.zeroize();
    let (user, _) = result.context("Registration failed")?;

    println!("Account created for {}", user.email);
    finish_sign_in(app).await
}

async fn cmd_logout(app: &App) -> Result<()> {
    if !app.authority.is_authenticated() {
        println!("Not signed in.");
        return Ok(());
    }

    app.authority.logout().await;
    app.router
        .update_auth_state(&app.authority.auth_state())
        .await;
    println!("Signed out. Local storage is active again.");
    Ok(())
}

async fn cmd_whoami(app: &App) -> Result<()> {
    app.require_signed_in()?;

    let user = app
        .authority
        .current_user()
        .await
        .context("Failed to fetch account")?;

    match user {
        Some(user) => {
            println!("Email: {}", user.email);
            println!("  ID: {}", user.id);
            if let Some(name) = &user.name {
                println!("  Name: {}", name);
            }
            if let Some(status) = &user.subscription_status {
                println!("  Subscription: {}", status);
            }
        }
        None => println!("Not signed in."),
    }
    Ok(())
}

async fn cmd_session_get(app: &App, date: Option<String>) -> Result<()> {
    let date = parse_date(date)?;
    let session = app
        .router
        .get_session(&date)
        .await
        .context("Failed to read session")?;

    match session {
        Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
        None => println!("No session saved for {}.", date),
    }
    Ok(())
}

async fn cmd_save_memo(app: &App, date: Option<String>, hour: u8, text: String) -> Result<()> {
    if usize::from(hour) >= tarotsync_common::HOURS_PER_DAY {
        anyhow::bail!("Hour must be between 0 and 23");
    }
    let date = parse_date(date)?;

    let mut memos: Memos = app
        .router
        .get_memos(&date)
        .await
        .context("Failed to read memos")?;
    memos.insert(hour, text);

    app.write(app.router.save_memos(&date, memos)).await?;
    println!("Memo saved for {} {:02}:00", date, hour);
    Ok(())
}

async fn cmd_spread_list(app: &App) -> Result<()> {
    let spreads = app
        .router
        .get_spreads()
        .await
        .context("Failed to list spreads")?;

    if spreads.is_empty() {
        println!("No spreads saved.");
        return Ok(());
    }

    for spread in spreads {
        println!(
            "{}  {}  [{}]  {}",
            spread.id,
            spread.created_at.format("%Y-%m-%d"),
            spread.spread_type,
            spread.title
        );
    }
    Ok(())
}

async fn cmd_spread_add(app: &App, title: String, spread_type: String, insights: String) -> Result<()> {
    if title.trim().is_empty() {
        anyhow::bail!("Title cannot be empty");
    }

    let mut spread = SpreadRecord::new(title, spread_type);
    spread.insights = insights;
    let id = spread.id.clone();

    app.write(app.router.save_spread(spread)).await?;
    println!("Spread saved: {}", id);
    Ok(())
}

async fn cmd_spread_delete(app: &App, id: &str) -> Result<()> {
    app.write(app.router.delete_spread(id)).await?;
    println!("Spread deleted: {}", id);
    Ok(())
}

async fn cmd_status(app: &App) -> Result<()> {
    let status = app.router.status();

    println!("Storage: {}", status.phase);
    println!("  Signed in: {}", status.is_authenticated);
    println!("  Online: {}", status.is_online);
    println!("  Queued writes: {}", status.queue_size);

    if let Some(report) = app.router.last_migration() {
        println!(
            "  Last migration: {} record(s), {} failure(s)",
            report.migrated(),
            report.failures.len()
        );
    }

    if status.is_authenticated {
        match app.router.remote().sync_status().await {
            Ok(server) => println!("Server: {}", serde_json::to_string_pretty(&server)?),
            Err(e) => println!("Server: unavailable ({})", e),
        }
    }
    Ok(())
}

async fn cmd_export(app: &App, output: Option<&Path>) -> Result<()> {
    app.require_signed_in()?;

    let data = app
        .router
        .remote()
        .export_data()
        .await
        .context("Export failed")?;
    let rendered = serde_json::to_string_pretty(&data)?;

    match output {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

/// Write a file readable only by its owner (Unix only).
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    // an older file keeps its mode on open
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "tarotsync",
            "--data-dir",
            "/tmp/tarot",
            "spread",
            "add",
            "--title",
            "Morning",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/tarot")));
        match cli.command {
            Commands::Spread(SpreadCommands::Add {
                title, spread_type, ..
            }) => {
                assert_eq!(title, "Morning");
                assert_eq!(spread_type, "three-card");
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_stored_session_roundtrip() {
        let credentials = Credentials::new("a", "r", Utc::now());
        let state = AuthState::Authenticated {
            credentials: credentials.clone(),
            user: UserInfo {
                id: "u1".to_string(),
                email: "reader@example.com".to_string(),
                name: None,
                language: None,
                timezone: None,
                subscription_status: None,
                trial_end_date: None,
            },
        };

        let stored = StoredSession::from_state(&state).unwrap();
        let raw = serde_json::to_string(&stored).unwrap();
        let back: StoredSession = serde_json::from_str(&raw).unwrap();

        assert_eq!(back.credentials(), credentials);
        assert!(StoredSession::from_state(&AuthState::LoggedOut).is_none());
    }

    #[tokio::test]
    async fn test_default_config_written_once() {
        let dir = tempfile::tempdir().unwrap();

        let first = load_config(dir.path()).await.unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());

        let second = load_config(dir.path()).await.unwrap();
        assert_eq!(first.api_base_url, second.api_base_url);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_private(&path, b"{\"refreshToken\":\"r\"}").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"refreshToken\":\"r\"}");

        let fresh = dir.path().join("fresh.json");
        write_private(&fresh, b"{}").await.unwrap();
        let mode = std::fs::metadata(&fresh).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_parse_date_defaults_to_today() {
        assert_eq!(parse_date(None).unwrap(), SessionDate::today());
        assert!(parse_date(Some("2025-13-40".to_string())).is_err());
    }
}
