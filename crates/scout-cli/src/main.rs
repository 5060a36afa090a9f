use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use scout_client::{PageExtractor, ReqwestTransport};
use scout_core::error::{AppError, FetchError};
use scout_core::models::{
    ChangeRecord, Content, ResourceFingerprint, ResourceKey, TransportKind,
};
use scout_core::settings::{Settings, SiteSelection};
use scout_core::traits::{FingerprintStore, MemoryStore, Transport, UnavailableTransport};
use scout_core::{FetchOrchestrator, ScrapeSession, SessionConfig, SessionSummary, TracingReporter};
use scout_db::{Database, DatabaseConfig, FingerprintRepository};

const DEFAULT_CONFIG: &str = "config/sites.yaml";

#[derive(Parser)]
#[command(name = "scout", version, about = "Change tracker for VC portfolio and news pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the configured sites and record what changed
    #[command(group(ArgGroup::new("sites").required(true).args(["all_sites", "site"])))]
    Run {
        /// Scrape every active site
        #[arg(long)]
        all_sites: bool,

        /// Scrape only the named site (repeatable; runs even if inactive)
        #[arg(long, value_name = "NAME")]
        site: Vec<String>,

        /// Path to the sites YAML file
        #[arg(short, long, env = "SCOUT_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Detect changes without writing fingerprints or change records
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Targets processed at once (overrides scraping.max_concurrent_requests)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=20))]
        concurrency: Option<u16>,

        /// Write the session summary as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show recently detected changes
    Changes {
        /// Look-back window in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,

        /// Maximum number of changes to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Validate the sites file and list the targets it produces
    CheckConfig {
        /// Path to the sites YAML file
        #[arg(short, long, env = "SCOUT_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("scout=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            all_sites,
            site,
            config,
            dry_run,
            concurrency,
            output,
        } => {
            let selection = if all_sites {
                SiteSelection::All
            } else {
                SiteSelection::Named(site)
            };
            let cancel = cancel_on_ctrl_c();
            cmd_run(
                &config,
                &selection,
                dry_run,
                concurrency.map(usize::from),
                output.as_deref(),
                &cancel,
            )
            .await?;
        }
        Commands::Changes { hours, limit } => {
            cmd_changes(hours, limit).await?;
        }
        Commands::CheckConfig { config } => {
            cmd_check_config(&config)?;
        }
    }

    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
    cancel
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("Invalid configuration in {}", path.display()))
}

async fn connect_db(config: &DatabaseConfig) -> Result<Database> {
    let db = Database::connect(config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    Ok(db)
}

async fn cmd_run(
    config: &Path,
    selection: &SiteSelection,
    dry_run: bool,
    concurrency: Option<usize>,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let settings = load_settings(config)?;
    let targets = settings
        .targets(selection)
        .context("Failed to resolve sites")?;

    if targets.is_empty() {
        tracing::warn!("No targets selected, nothing to do");
    }

    let store = open_store(dry_run).await?;
    let http = ReqwestTransport::with_user_agent(&settings.scraping.user_agent)
        .context("Failed to create HTTP client")?;
    let browser = BrowserSlot::open().await;

    let orchestrator = FetchOrchestrator::new(
        http,
        browser,
        settings.breakers.http.to_config(),
        settings.breakers.browser.to_config(),
    )
    .with_config(settings.orchestrator_config());

    let session_config = SessionConfig::default()
        .with_concurrency(concurrency.unwrap_or(settings.scraping.max_concurrent_requests))
        .with_dry_run(dry_run);

    let session =
        ScrapeSession::new(orchestrator, PageExtractor::new(), store).with_config(session_config);
    let summary = session.run(&targets, cancel, &TracingReporter).await;

    print_summary(&summary);

    if let Some(path) = output {
        match write_summary(path, &summary) {
            Ok(()) => tracing::info!(path = %path.display(), "Summary written"),
            Err(e) => tracing::error!(error = %format!("{e:#}"), "Summary not written"),
        }
    }

    Ok(())
}

/// A completed run still exits 0 when this fails; the caller only logs it.
fn write_summary(path: &Path, summary: &SessionSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    Ok(())
}

/// Dry runs without a database compare against an empty in-memory store, so
/// every record reads as new.
async fn open_store(dry_run: bool) -> Result<Store> {
    let config = match DatabaseConfig::optional_from_env().context("Invalid database settings")? {
        Some(config) => config,
        None if dry_run => {
            tracing::info!("DATABASE_URL not set, dry run uses an in-memory store");
            return Ok(Store::Memory(MemoryStore::new()));
        }
        None => anyhow::bail!("DATABASE_URL not set. Required unless --dry-run is given."),
    };

    let db = connect_db(&config).await?;
    Ok(Store::Postgres(db.fingerprints()))
}

fn print_summary(summary: &SessionSummary) {
    let mode = if summary.dry_run { " (dry run)" } else { "" };
    println!("Session {}{mode}", summary.session_id);
    println!(
        "  targets: {}  fetched: {}  records: {}",
        summary.targets, summary.pages_fetched, summary.records_found
    );
    println!(
        "  new: {}  changed: {}  unchanged: {}",
        summary.new, summary.changed, summary.unchanged
    );
    if summary.cancelled > 0 {
        println!("  cancelled: {}", summary.cancelled);
    }

    for error in &summary.errors {
        println!(
            "  [ERROR] {} {} ({}): {}",
            error.site, error.url, error.kind, error.message
        );
    }

    for breaker in &summary.breakers {
        println!(
            "  breaker {}: {} ({} failures)",
            breaker.name, breaker.state, breaker.failure_count
        );
    }
}

async fn cmd_changes(hours: u32, limit: usize) -> Result<()> {
    let config = DatabaseConfig::from_env().context("Change history needs a database")?;
    let db = connect_db(&config).await?;

    let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
    let changes = db
        .fingerprints()
        .recent_changes(since, limit)
        .await
        .context("Failed to load changes")?;

    if changes.is_empty() {
        println!("No changes in the last {hours}h");
        return Ok(());
    }

    println!("Changes in the last {hours}h:\n");

    for change in &changes {
        println!(
            "  [{}] {} {} {} (hash: {}...)",
            change.outcome.as_str().to_uppercase(),
            change.detected_at.format("%Y-%m-%d %H:%M:%S UTC"),
            change.record_kind.as_str(),
            change.resource,
            change.new_hash.get(..8).unwrap_or(&change.new_hash),
        );
    }

    println!("\nTotal: {} changes", changes.len());

    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let settings = load_settings(path)?;
    let targets = settings
        .targets(&SiteSelection::All)
        .context("Failed to resolve sites")?;

    println!("{}: OK", path.display());

    for site in &settings.sites {
        let count = targets.iter().filter(|t| t.site == site.name).count();
        let transport = site.transport().map_or("auto", |t| t.as_str());
        let state = if site.active { "active" } else { "inactive" };
        println!(
            "  {} [{state}] {} targets, transport: {transport}",
            site.name, count
        );
    }

    println!("\nTotal: {} active targets", targets.len());

    Ok(())
}

/// Fingerprint backend chosen at startup.
#[derive(Clone)]
enum Store {
    Memory(MemoryStore),
    Postgres(FingerprintRepository),
}

impl FingerprintStore for Store {
    async fn get_fingerprint(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ResourceFingerprint>, AppError> {
        match self {
            Store::Memory(s) => s.get_fingerprint(key).await,
            Store::Postgres(s) => FingerprintStore::get_fingerprint(s, key).await,
        }
    }

    async fn upsert_fingerprint(
        &self,
        key: &ResourceKey,
        content_hash: &str,
        seen_at: chrono::DateTime<Utc>,
    ) -> Result<ResourceFingerprint, AppError> {
        match self {
            Store::Memory(s) => s.upsert_fingerprint(key, content_hash, seen_at).await,
            Store::Postgres(s) => {
                FingerprintStore::upsert_fingerprint(s, key, content_hash, seen_at).await
            }
        }
    }

    async fn record_change(&self, change: &ChangeRecord) -> Result<(), AppError> {
        match self {
            Store::Memory(s) => s.record_change(change).await,
            Store::Postgres(s) => FingerprintStore::record_change(s, change).await,
        }
    }
}

/// Browser transport, or a placeholder when Chromium is not compiled in or
/// fails to launch. The placeholder fails every fetch with
/// `TransportUnavailable`, which trips nothing and surfaces per target.
#[derive(Clone)]
enum BrowserSlot {
    #[cfg(feature = "browser")]
    Chromium(scout_client::BrowserTransport),
    Unavailable(UnavailableTransport),
}

impl BrowserSlot {
    #[cfg(feature = "browser")]
    async fn open() -> Self {
        match scout_client::BrowserTransport::launch().await {
            Ok(browser) => BrowserSlot::Chromium(browser),
            Err(e) => {
                tracing::warn!(error = %e, "Browser unavailable, script-heavy pages will fail");
                BrowserSlot::Unavailable(UnavailableTransport::new(TransportKind::Browser))
            }
        }
    }

    #[cfg(not(feature = "browser"))]
    async fn open() -> Self {
        tracing::debug!("Built without the browser feature");
        BrowserSlot::Unavailable(UnavailableTransport::new(TransportKind::Browser))
    }
}

impl Transport for BrowserSlot {
    fn kind(&self) -> TransportKind {
        TransportKind::Browser
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Content, FetchError> {
        match self {
            #[cfg(feature = "browser")]
            BrowserSlot::Chromium(t) => t.fetch(url, timeout).await,
            BrowserSlot::Unavailable(t) => t.fetch(url, timeout).await,
        }
    }
}
