use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use offer_relay::channels::session::login;
use offer_relay::channels::{ChannelReader, SessionReader, TelegramReader, TelegramSender};
use offer_relay::config::{
    CATCH_UP_WINDOW_HOURS, ReaderConfig, RelayConfig, db_path_from_env, log_dir_from_env,
    reader_from_env,
};
use offer_relay::context::RelayContext;
use offer_relay::extract::{OfferExtractor, PatternExtractor, SemanticExtractor};
use offer_relay::ingest::{Backfill, PeriodicScheduler, spawn_live_feed};
use offer_relay::llm::create_provider;
use offer_relay::pipeline::{OfferPipeline, Relay};
use offer_relay::store::{Database, LibSqlBackend, normalize_source};

#[derive(Parser)]
#[command(name = "offer-relay", version)]
#[command(about = "Relay affordable sale offers from public channels to one chat")]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live feed and the periodic backfill (default)
    Run,

    /// Walk recent history of every source once, then exit
    CatchUp {
        #[arg(long, default_value_t = CATCH_UP_WINDOW_HOURS, value_parser = clap::value_parser!(i64).range(1..))]
        hours: i64,
    },

    /// Manage monitored sources
    #[command(subcommand)]
    Sources(SourcesCommand),

    /// Manage the reading user session
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Sign the reading account in and save the session file
    Login {
        /// Phone number of the account, international format
        #[arg(long, env = "TELEGRAM_PHONE")]
        phone: String,
    },
}

#[derive(Subcommand)]
enum SourcesCommand {
    /// Register a source (`name`, `@name`, `t.me/name` or a numeric chat id)
    Add {
        identifier: String,
        #[arg(long, default_value = "cli")]
        by: String,
        /// Store the identifier without looking the channel up or joining it
        #[arg(long)]
        no_verify: bool,
    },

    /// List registered sources
    List,

    /// Unregister a source
    Remove { identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing(log_dir_from_env().as_deref())?;

    match cli.cmd.unwrap_or(Command::Run) {
        Command::Run => run(RelayConfig::from_env()?).await,
        Command::CatchUp { hours } => catch_up(RelayConfig::from_env()?, hours).await,
        Command::Sources(cmd) => sources(cmd).await,
        Command::Session(cmd) => session(cmd).await,
    }
}

/// stderr always; a daily rolling file as well when a log dir is set.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("offer-relay")
                .filename_suffix("log")
                .build(dir)
                .with_context(|| format!("Failed to open log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn open_store(path: &Path) -> anyhow::Result<Arc<dyn Database>> {
    let store = LibSqlBackend::new_local(path)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn build_reader(config: &ReaderConfig) -> anyhow::Result<Arc<dyn ChannelReader>> {
    match config {
        ReaderConfig::Session(settings) => {
            let reader = SessionReader::connect(settings)
                .await
                .context("Failed to open the reading session")?;
            Ok(Arc::new(reader))
        }
        ReaderConfig::Bot { token } => {
            warn!(
                "TELEGRAM_API_ID not set; reading through the Bot API, which only sees \
                 channels where the bot is an administrator"
            );
            Ok(Arc::new(TelegramReader::new(token.clone())))
        }
    }
}

async fn connect(config: &RelayConfig) -> anyhow::Result<RelayContext> {
    let reader = build_reader(&config.reader).await?;
    let store = open_store(&config.db_path).await?;
    let sender = Arc::new(TelegramSender::new(config.bot_token.clone()));
    Ok(RelayContext::new(store, reader, sender))
}

fn build_pipeline(config: &RelayConfig, ctx: &RelayContext) -> Arc<OfferPipeline> {
    let relay = Relay::new(
        Arc::clone(&ctx.sender),
        Arc::clone(&ctx.store),
        config.target_chat_id.clone(),
    );
    Arc::new(OfferPipeline::new(
        Arc::clone(&ctx.store),
        relay,
        config.price_ceiling,
    ))
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let live_extractor: Arc<dyn OfferExtractor> = match &config.llm {
        Some(llm) => {
            info!(model = %llm.model, "Live feed uses semantic extraction");
            Arc::new(SemanticExtractor::new(create_provider(llm)?))
        }
        None => {
            warn!("No OPENAI_API_KEY or ANTHROPIC_API_KEY set; live feed uses pattern extraction");
            Arc::new(PatternExtractor)
        }
    };

    let ctx = connect(&config).await?;
    if let Err(e) = ctx.sender.health_check().await {
        ctx.shutdown().await;
        return Err(e).context("Destination bot is unreachable");
    }

    info!(
        db = %config.db_path.display(),
        target = %config.target_chat_id,
        price_ceiling = %config.price_ceiling,
        backfill_every_secs = config.backfill_interval.as_secs(),
        backfill_window_hours = config.backfill_window_hours,
        log_dir = ?config.log_dir,
        "Offer relay starting"
    );

    let pipeline = build_pipeline(&config, &ctx);

    let mut live = spawn_live_feed(ctx.clone(), Arc::clone(&pipeline), live_extractor);

    let backfill = Arc::new(Backfill::new(
        ctx.clone(),
        Arc::clone(&pipeline),
        Arc::new(PatternExtractor),
        config.relay_pause,
    ));
    let mut periodic = backfill.spawn(
        PeriodicScheduler::new(config.backfill_interval).with_jitter(config.backfill_jitter),
        chrono::Duration::hours(config.backfill_window_hours),
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown requested");
        }
        _ = live.finished() => warn!("Live feed ended; shutting down"),
        _ = periodic.finished() => warn!("Backfill scheduler ended; shutting down"),
    }

    tokio::join!(live.stop(), periodic.stop());
    ctx.shutdown().await;
    info!("Offer relay stopped");
    Ok(())
}

async fn catch_up(config: RelayConfig, hours: i64) -> anyhow::Result<()> {
    let ctx = connect(&config).await?;
    let pipeline = build_pipeline(&config, &ctx);
    let backfill = Backfill::new(
        ctx.clone(),
        pipeline,
        Arc::new(PatternExtractor),
        config.relay_pause,
    );

    let result = backfill.run_cycle(chrono::Duration::hours(hours)).await;
    ctx.shutdown().await;

    let report = result.context("Catch-up failed")?;
    println!(
        "Catch-up over {hours}h: {} source(s), {} message(s), {} relayed, {} failure(s)",
        report.sources, report.messages, report.relayed, report.failures
    );
    Ok(())
}

async fn sources(cmd: SourcesCommand) -> anyhow::Result<()> {
    let store = open_store(&db_path_from_env()).await?;

    match cmd {
        SourcesCommand::Add {
            identifier,
            by,
            no_verify,
        } => {
            let mut identifier = normalize_source(&identifier);
            if !no_verify {
                identifier = verify_source(&identifier).await?;
            }
            if store.add_source(&identifier, &by).await? {
                println!("Added {identifier}");
            } else {
                println!("{identifier} is already registered");
            }
        }
        SourcesCommand::List => {
            let sources = store.list_sources().await?;
            if sources.is_empty() {
                println!("No sources registered");
            }
            for source in sources {
                println!(
                    "{}\tadded {} by {}",
                    source.identifier,
                    source.added_at.format("%Y-%m-%d %H:%M UTC"),
                    source.added_by
                );
            }
        }
        SourcesCommand::Remove { identifier } => {
            let identifier = normalize_source(&identifier);
            if store.remove_source(&identifier).await? {
                println!("Removed {identifier}");
            } else {
                println!("{identifier} is not registered");
            }
        }
    }

    store.close().await?;
    Ok(())
}

/// Look the channel up through the reader and join it; returns the
/// identifier the channel is known by.
async fn verify_source(identifier: &str) -> anyhow::Result<String> {
    let reader = build_reader(&reader_from_env()?).await?;
    let resolved = reader.resolve_source(identifier).await;
    if let Err(e) = reader.shutdown().await {
        warn!(error = %e, "Reader shutdown failed");
    }
    resolved.with_context(|| format!("Could not find {identifier}; pass --no-verify to store it anyway"))
}

async fn session(cmd: SessionCommand) -> anyhow::Result<()> {
    match cmd {
        SessionCommand::Login { phone } => {
            let ReaderConfig::Session(settings) = reader_from_env()? else {
                anyhow::bail!("Set TELEGRAM_API_ID and TELEGRAM_API_HASH to sign a session in");
            };
            login(&settings, &phone, prompt_line)
                .await
                .context("Sign-in failed")?;
            println!("Signed in; session saved to {}", settings.session_path.display());
        }
    }
    Ok(())
}

fn prompt_line(label: &str) -> std::io::Result<String> {
    use std::io::Write;

    eprint!("{label}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line)
}
