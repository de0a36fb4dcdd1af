use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use footfall_store::spawn_store;

#[derive(Parser)]
#[command(name = "footfall", about = "Footfall visitor analytics CLI")]
struct Cli {
    /// Path to the SQLite database (default: $FOOTFALL_DB_PATH or
    /// ~/.local/share/footfall/visits.db).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database
    Init,
    /// Per-day entry/exit counts
    Stats {
        /// Number of most recent days to show
        #[arg(long, default_value_t = 14)]
        days: u32,
    },
    /// List known visitors with visit totals
    Visitors,
    /// Show the most recent events
    Events {
        /// Maximum number of events to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn db_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.db {
        return path.clone();
    }
    if let Ok(path) = std::env::var("FOOTFALL_DB_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/share/footfall/visits.db")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let path = db_path(&cli);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    let store = spawn_store(&path, Duration::from_secs(10))
        .with_context(|| format!("opening database {}", path.display()))?;

    match cli.command {
        Commands::Init => {
            // spawn_store already created the schema; report what's there.
            let visitors = store.visitor_count().await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "db": path, "visitors": visitors })
                );
            } else {
                println!("Database ready: {}", path.display());
                println!("Visitors registered: {visitors}");
            }
        }
        Commands::Stats { days } => {
            let counts = store.daily_counts(days).await?;
            if cli.json {
                let rows: Vec<_> = counts
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "day": c.day, "entries": c.entries, "exits": c.exits
                        })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            } else if counts.is_empty() {
                println!("No events recorded");
            } else {
                println!("{:<12} {:>8} {:>8}", "day", "entries", "exits");
                for c in counts {
                    println!("{:<12} {:>8} {:>8}", c.day, c.entries, c.exits);
                }
            }
        }
        Commands::Visitors => {
            let summaries = store.visitor_summaries().await?;
            if cli.json {
                let rows: Vec<_> = summaries
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "visitor": s.visitor.to_string(),
                            "first_seen": s.first_seen.to_rfc3339(),
                            "last_seen": s.last_seen.to_rfc3339(),
                            "entries": s.entries,
                            "exits": s.exits,
                        })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            } else if summaries.is_empty() {
                println!("No visitors registered");
            } else {
                println!(
                    "{:<36} {:<25} {:<25} {:>7} {:>6}",
                    "visitor", "first seen", "last seen", "entries", "exits"
                );
                for s in summaries {
                    println!(
                        "{:<36} {:<25} {:<25} {:>7} {:>6}",
                        s.visitor,
                        s.first_seen.to_rfc3339(),
                        s.last_seen.to_rfc3339(),
                        s.entries,
                        s.exits
                    );
                }
            }
        }
        Commands::Events { limit } => {
            let events = store.recent_events(limit).await?;
            if cli.json {
                let rows: Vec<_> = events
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "event_id": e.event_id,
                            "timestamp": e.event.timestamp.to_rfc3339(),
                            "visitor": e.event.visitor.to_string(),
                            "type": e.event.kind.as_str(),
                            "confidence": e.event.confidence,
                            "crop_path": e.event.crop_path,
                        })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            } else if events.is_empty() {
                println!("No events recorded");
            } else {
                for e in events {
                    println!(
                        "#{:<6} {} {:<5} {} (confidence {:.2}){}",
                        e.event_id,
                        e.event.timestamp.to_rfc3339(),
                        e.event.kind,
                        e.event.visitor,
                        e.event.confidence,
                        e.event
                            .crop_path
                            .map(|p| format!(" crop={p}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}
