use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use prowl_client::{ReqwestTransport, SelectorParser};
use prowl_core::distributor;
use prowl_core::models::date_seed;
use prowl_core::traits::{RecordSink, SessionStore};
use prowl_core::{
    AreaCode, CrawlMode, CrawlerConfig, InvocationRequest, MemorySessionStore, NullSink,
    SessionOrchestrator, SessionStatus, SessionSummary, TracingSessionReporter,
};
use prowl_store::{Database, DatabaseConfig, NdjsonFileSink, PgSessionStore};

#[derive(Parser)]
#[command(name = "prowl", version, about = "Low-profile listing crawler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawl session to completion
    Run {
        /// Invocation payload as JSON; flags below override its fields
        #[arg(long)]
        event: Option<String>,

        /// Session id (generated when neither this nor --event sets one)
        #[arg(short, long)]
        session_id: Option<String>,

        /// Pacing mode: stealth, normal or testing
        #[arg(short, long)]
        mode: Option<CrawlMode>,

        /// Stop after this many collected listings
        #[arg(long)]
        max_items: Option<u64>,

        /// Wall-clock budget for the session
        #[arg(long)]
        max_runtime_minutes: Option<u64>,

        /// Override the configured site base URL
        #[arg(long)]
        entry_point: Option<String>,

        /// Crawl exactly these areas instead of the day's assignment
        #[arg(long, value_delimiter = ',')]
        areas: Option<Vec<String>>,

        /// Position of this session within the day
        #[arg(long)]
        ordinal: Option<u32>,

        /// Date seeding the area partition (YYYY-MM-DD, defaults to today UTC)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Crawler configuration file (JSON)
        #[arg(short, long, env = "PROWL_CONFIG")]
        config: Option<PathBuf>,

        /// Root directory for listings and summaries
        #[arg(short, long, env = "PROWL_OUTPUT_DIR", default_value = "output")]
        output: PathBuf,

        /// Keep session state in memory instead of PostgreSQL
        #[arg(long, default_value_t = false)]
        memory_store: bool,

        /// Discard records instead of writing them
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Per-request timeout
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Route requests through this proxy (http, https or socks5 URL)
        #[arg(long, env = "PROWL_PROXY")]
        proxy: Option<String>,
    },

    /// Show how a day's areas are split across sessions
    Plan {
        /// Crawler configuration file (JSON)
        #[arg(short, long, env = "PROWL_CONFIG")]
        config: Option<PathBuf>,

        /// Date to plan (YYYY-MM-DD, defaults to today UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Show stored session state
    Inspect {
        /// Show one session in full
        #[arg(short, long)]
        session_id: Option<String>,

        /// Number of recent sessions to list
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Delete session records past their retention window
    Purge,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("prowl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            event,
            session_id,
            mode,
            max_items,
            max_runtime_minutes,
            entry_point,
            areas,
            ordinal,
            date,
            config,
            output,
            memory_store,
            dry_run,
            timeout_secs,
            proxy,
        } => {
            let mut request = match event {
                Some(raw) => parse_event(&raw)?,
                None => InvocationRequest::new(
                    session_id
                        .clone()
                        .unwrap_or_else(|| format!("manual-{}", uuid::Uuid::new_v4().simple())),
                ),
            };
            if let Some(id) = session_id {
                request.session_id = id;
            }
            if let Some(mode) = mode {
                request.mode = mode;
            }
            if max_items.is_some() {
                request.max_items = max_items;
            }
            if max_runtime_minutes.is_some() {
                request.max_runtime_minutes = max_runtime_minutes;
            }
            if entry_point.is_some() {
                request.entry_point = entry_point;
            }
            if let Some(areas) = areas {
                request.area_override = Some(areas.into_iter().map(AreaCode::from).collect());
            }
            if ordinal.is_some() {
                request.session_ordinal = ordinal;
            }
            if date.is_some() {
                request.date = date;
            }

            let options = RunOptions {
                config: load_config(config.as_deref())?,
                timeout: Duration::from_secs(timeout_secs),
                proxy,
            };

            let summary = match (memory_store, dry_run) {
                (true, true) => {
                    cmd_run(&request, options, MemorySessionStore::default(), NullSink).await?
                }
                (true, false) => {
                    let sink = NdjsonFileSink::new(output);
                    cmd_run(&request, options, MemorySessionStore::default(), sink).await?
                }
                (false, true) => {
                    let store = connect_store().await?;
                    cmd_run(&request, options, store, NullSink).await?
                }
                (false, false) => {
                    let store = connect_store().await?;
                    cmd_run(&request, options, store, NdjsonFileSink::new(output)).await?
                }
            };

            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.status == SessionStatus::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Plan { config, date } => {
            let config = load_config(config.as_deref())?;
            cmd_plan(&config, date.unwrap_or_else(|| Utc::now().date_naive()))?;
        }
        Commands::Inspect { session_id, limit } => {
            let store = connect_store().await?;
            cmd_inspect(&store, session_id.as_deref(), limit).await?;
        }
        Commands::Purge => {
            let store = connect_store().await?;
            let purged = store.purge_expired().await.map_err(|e| anyhow::anyhow!(e))?;
            println!("Purged {purged} expired session(s)");
        }
    }

    Ok(ExitCode::SUCCESS)
}

struct RunOptions {
    config: CrawlerConfig,
    timeout: Duration,
    proxy: Option<String>,
}

fn parse_event(raw: &str) -> Result<InvocationRequest> {
    // `@path` reads the payload from a file.
    let body = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&body).context("Invalid invocation payload")
}

fn load_config(path: Option<&Path>) -> Result<CrawlerConfig> {
    let config = match path {
        Some(path) => CrawlerConfig::from_file(path).map_err(|e| anyhow::anyhow!(e))?,
        None => {
            tracing::warn!("No config file given, using built-in defaults");
            CrawlerConfig::default()
        }
    };
    if config.areas.is_empty() {
        tracing::warn!("Area catalog is empty; sessions without --areas will crawl nothing");
    }
    Ok(config)
}

/// Connect to PostgreSQL using DATABASE_URL and bring the schema up to date.
async fn connect_store() -> Result<PgSessionStore> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.sessions())
}

async fn cmd_run<S, K>(
    request: &InvocationRequest,
    options: RunOptions,
    store: S,
    sink: K,
) -> Result<SessionSummary>
where
    S: SessionStore,
    K: RecordSink,
{
    let transport = ReqwestTransport::with_options(options.timeout, options.proxy.as_deref())
        .map_err(|e| anyhow::anyhow!(e))?;
    let parser = SelectorParser::new(&options.config.selectors).map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = SessionOrchestrator::new(transport, parser, store, sink, options.config)
        .map_err(|e| anyhow::anyhow!(e))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, winding the session down");
            on_signal.cancel();
        }
    });

    tracing::info!(
        session_id = %request.session_id,
        mode = %request.mode,
        "Starting session"
    );

    Ok(orchestrator
        .run(request, cancel, &TracingSessionReporter)
        .await)
}

fn cmd_plan(config: &CrawlerConfig, date: NaiveDate) -> Result<()> {
    let seed = date_seed(date);
    let plan = distributor::plan_day(&config.areas, config.sessions_per_day, &seed)
        .map_err(|e| anyhow::anyhow!(e))?;

    println!(
        "Area plan for {seed} ({} areas across {} sessions):\n",
        config.areas.len(),
        config.sessions_per_day
    );
    for (ordinal, areas) in plan.iter().enumerate() {
        let codes: Vec<&str> = areas.iter().map(AreaCode::as_str).collect();
        println!("  session {ordinal}: [{}] {}", areas.len(), codes.join(", "));
    }

    Ok(())
}

async fn cmd_inspect(store: &PgSessionStore, session_id: Option<&str>, limit: usize) -> Result<()> {
    if let Some(id) = session_id {
        match store.get(id).await.map_err(|e| anyhow::anyhow!(e))? {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => println!("No session found with id={id}"),
        }
        return Ok(());
    }

    let sessions = store
        .list_recent(limit)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if sessions.is_empty() {
        println!("No sessions recorded");
        return Ok(());
    }

    println!("Recent sessions:\n");
    for session in &sessions {
        println!(
            "  [{}] {} started {} (ordinal {}, areas {}/{}, items {} ok / {} failed)",
            session.status,
            session.session_id,
            session.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            session.session_ordinal,
            session.areas_completed,
            session.assigned_areas.len(),
            session.items_collected,
            session.items_failed,
        );
        if let Some(reason) = session.abort_reason.as_deref().or(session.error.as_deref()) {
            println!("      {reason}");
        }
    }

    println!("\nTotal: {} sessions", sessions.len());

    Ok(())
}
