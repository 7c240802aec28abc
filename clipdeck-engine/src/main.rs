//! Clipdeck command-line entry point
//!
//! Drives the engine for one-shot jobs: acquire a source into the cache,
//! compute optimized cut points, or inspect the cache database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clipdeck_common::config::EngineConfig;
use clipdeck_common::events::{AcquisitionStatus, ProgressEvent};
use clipdeck_engine::acquisition::ProgressCallback;
use clipdeck_engine::build_info;
use clipdeck_engine::{AcquireSource, ClipdeckEngine, SourceKey, StoreBackend};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CLIPDECK_GIT_HASH"),
    ", built ",
    env!("CLIPDECK_BUILD_TIMESTAMP"),
    ", ",
    env!("CLIPDECK_BUILD_PROFILE"),
    ")"
);

/// Command-line arguments for clipdeck
#[derive(Parser, Debug)]
#[command(name = "clipdeck")]
#[command(about = "Audio acquisition, caching and cut-point tool")]
#[command(version, long_version = LONG_VERSION)]
struct Args {
    /// Configuration file (overrides CLIPDECK_CONFIG and the platform file)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache database path
    #[arg(long, global = true, env = "CLIPDECK_CACHE_DB")]
    cache_db: Option<PathBuf>,

    /// Keep the cache in memory only
    #[arg(long, global = true, conflicts_with = "cache_db")]
    memory_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download (or read) and decode a source into the cache
    Acquire {
        /// URL, local file path, or existing source key
        source: String,

        /// Store the cached samples as 16-bit PCM
        #[arg(long)]
        compress: bool,
    },

    /// Acquire a source and snap a region to nearby zero crossings
    Cut {
        source: String,

        /// Region start in seconds
        #[arg(long)]
        start: f64,

        /// Region end in seconds
        #[arg(long)]
        end: f64,
    },

    /// Inspect or modify the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Print cache statistics as JSON
    Stats,
    /// Remove every entry
    Clear,
    /// Remove one entry by source key
    Remove { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, source) =
        EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting clipdeck {}", LONG_VERSION);
    debug!("Configuration source: {:?}", source);

    let backend = if args.memory_only {
        StoreBackend::Disabled
    } else {
        StoreBackend::Sqlite(args.cache_db.clone())
    };

    let mut engine = ClipdeckEngine::builder(config)
        .store(backend)
        .without_background_tasks()
        .build()
        .await
        .context("Failed to initialize engine")?;

    let outcome = run(&engine, args.command).await;
    engine.shutdown();
    outcome
}

async fn run(engine: &ClipdeckEngine, command: Command) -> Result<()> {
    match command {
        Command::Acquire { source, compress } => {
            if compress {
                engine.cache().set_compression(true);
            }
            let audio = acquire(engine, &source).await?;
            println!("key:         {}", audio.key);
            println!("duration:    {:.3}s", audio.buffer.duration());
            println!("channels:    {}", audio.buffer.channel_count());
            println!("sample rate: {} Hz", audio.buffer.sample_rate());
            println!("waveform:    {} points", audio.waveform.len());
            println!("from cache:  {}", audio.from_cache);
        }

        Command::Cut { source, start, end } => {
            let audio = acquire(engine, &source).await?;
            let cut = engine
                .zero_crossing()
                .optimize_cut_points(&audio.buffer, start, end)
                .context("Invalid cut region")?;
            println!("start:       {:.6}s (requested {:.6}s)", cut.start, start);
            println!("end:         {:.6}s (requested {:.6}s)", cut.end, end);
            println!("quality:     {}", serde_json::to_string(&cut.quality)?.trim_matches('"'));
            println!("improvement: {:.3}", cut.average_improvement);
        }

        Command::Cache { action } => match action {
            CacheAction::Stats => {
                let stats = engine.cache().stats().await;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            CacheAction::Clear => {
                engine.cache().clear().await;
                println!("cache cleared");
            }
            CacheAction::Remove { key } => {
                let key = SourceKey::parse(&key).context("Invalid source key")?;
                if !engine.cache().remove(&key).await {
                    bail!("{} is not cached", key);
                }
                println!("removed {}", key);
            }
        },
    }
    Ok(())
}

async fn acquire(
    engine: &ClipdeckEngine,
    source: &str,
) -> Result<clipdeck_engine::acquisition::AcquiredAudio> {
    let source = AcquireSource::from_arg(source);
    let last_status = std::sync::Mutex::new(None::<AcquisitionStatus>);
    let on_progress: ProgressCallback = Arc::new(move |event: &ProgressEvent| {
        let mut last = last_status.lock().unwrap_or_else(|e| e.into_inner());
        if *last == Some(event.status) {
            return;
        }
        *last = Some(event.status);
        match (&event.error, event.attempt) {
            (Some(error), _) => eprintln!(
                "[{:>3}%] {}: {} ({})",
                event.progress, event.status, error.message, error.classification
            ),
            (None, Some(attempt)) if attempt > 1 => {
                eprintln!("[{:>3}%] {} (attempt {})", event.progress, event.status, attempt)
            }
            (None, _) => eprintln!("[{:>3}%] {}", event.progress, event.status),
        }
    });

    engine
        .pipeline()
        .acquire(&source, Some(on_progress))
        .await
        .context("Acquisition failed")
}
