use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rewinder::config::default_config_path;
use rewinder::{Config, ObservedAppState, TimelineStore};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rewinder")]
#[command(about = "Rewind desktop applications to an earlier window layout.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON Lines file of observed application states to ingest first
    #[arg(short, long, global = true)]
    feed: Option<PathBuf>,

    /// Override the checkpoint storage directory
    #[arg(long, global = true)]
    storage: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List tracked applications
    Apps,
    /// Show the snapshot timeline of an application
    Timeline {
        /// Application id or executable name
        app: String,
    },
    /// Reconstruct the full state of a snapshot as JSON
    Resolve {
        /// Application id or executable name
        app: String,
        /// Snapshot to resolve, counted from the newest (0 = latest)
        #[arg(short, long, default_value_t = 0)]
        nth: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(storage) = cli.storage {
        config.storage_root = storage;
    }

    let store = TimelineStore::new(&config);
    if let (Some(feed), false) = (&cli.feed, matches!(cli.command, Commands::Config)) {
        ingest_feed(&store, &config, feed)?;
    }

    match &cli.command {
        Commands::Apps => list_apps(&store)?,
        Commands::Timeline { app } => show_timeline(&store, app)?,
        Commands::Resolve { app, nth } => resolve(&store, app, *nth)?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default(&default_config_path())?,
    };
    config.validate()?;
    Ok(config)
}

fn ingest_feed(store: &TimelineStore, config: &Config, path: &Path) -> Result<()> {
    info!("Ingesting observations from {}", path.display());
    let file = File::open(path).with_context(|| format!("opening feed {}", path.display()))?;

    let (mut created, mut skipped) = (0usize, 0usize);
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", number + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let state: ObservedAppState = match serde_json::from_str(&line) {
            Ok(state) => state,
            Err(e) => {
                warn!("Skipping malformed observation on line {}: {}", number + 1, e);
                continue;
            }
        };
        if !config.rules.allow(&state.executable_path, &state.foreground_window_class) {
            debug!("Line {} excluded by rules", number + 1);
            skipped += 1;
            continue;
        }
        match store.ingest(&state)? {
            Some(_) => created += 1,
            None => skipped += 1,
        }
    }

    info!("Feed ingested: {} snapshots created, {} observations skipped", created, skipped);
    Ok(())
}

/// Accepts an application id or, case-insensitively, its executable name.
fn find_app(store: &TimelineStore, app: &str) -> Result<String> {
    let apps = store.get_apps()?;
    if let Some(found) = apps.iter().find(|a| a.app_id == app) {
        return Ok(found.app_id.clone());
    }
    let by_name: Vec<_> = apps.iter().filter(|a| a.name.eq_ignore_ascii_case(app)).collect();
    match by_name.as_slice() {
        [only] => Ok(only.app_id.clone()),
        [] => bail!("no tracked application matches {:?}", app),
        _ => {
            let ids: Vec<&str> = by_name.iter().map(|a| a.app_id.as_str()).collect();
            bail!("{:?} is ambiguous, use one of: {}", app, ids.join(", "))
        }
    }
}

fn list_apps(store: &TimelineStore) -> Result<()> {
    let apps = store.get_apps()?;
    println!("Tracked applications:");
    println!("{}", "─".repeat(60));
    for app in apps {
        println!(
            "{} - {} ({} snapshots, ~{} KiB, last active {})",
            app.app_id,
            app.name,
            app.snapshot_count,
            app.memory_bytes / 1024,
            app.last_activity.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn show_timeline(store: &TimelineStore, app: &str) -> Result<()> {
    let app_id = find_app(store, app)?;
    let snapshots = store.get_timeline(&app_id)?;

    println!("Timeline for {}", app_id);
    println!("{}", "─".repeat(60));
    for (n, meta) in snapshots.iter().enumerate() {
        println!(
            "#{:<3} {} {} windows:{} changed:{} files:+{}/-{}{}{}{}",
            n,
            meta.timestamp.format("%Y-%m-%d %H:%M:%S"),
            meta.snapshot_id,
            meta.window_count,
            meta.window_diffs,
            meta.files_added,
            meta.files_removed,
            if meta.clipboard_changed { " clipboard" } else { "" },
            if meta.plugin_changed { " plugins" } else { "" },
            if meta.checkpoint { " [checkpoint]" } else { "" },
        );
    }
    Ok(())
}

fn resolve(store: &TimelineStore, app: &str, nth: usize) -> Result<()> {
    let app_id = find_app(store, app)?;
    let snapshots = store.get_timeline(&app_id)?;
    let Some(meta) = snapshots.get(nth) else {
        bail!("{} has {} snapshots, #{} does not exist", app_id, snapshots.len(), nth);
    };

    let resolved = store
        .resolve_snapshot(&app_id, &meta.snapshot_id)
        .with_context(|| format!("resolving snapshot {}", meta.snapshot_id))?;
    debug!("Replayed {} deltas", resolved.replayed);
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}
