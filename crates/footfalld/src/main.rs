use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use footfall_core::{FrameOutcome, Gallery, IdentityResolver, Pipeline, VisitEvent};
use footfall_store::{spawn_store, EventLogger, StoreError};

mod config;
mod ingest;

/// Debounce timers fire between frames too; this is how often we check.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("footfalld starting");

    let cfg = config::Config::from_env();
    if !(cfg.similarity_threshold > 0.0 && cfg.similarity_threshold <= 1.0) {
        bail!(
            "FOOTFALL_SIMILARITY_THRESHOLD must be in (0, 1], got {}",
            cfg.similarity_threshold
        );
    }
    if cfg.embedding_dim == 0 {
        bail!("FOOTFALL_EMBEDDING_DIM must be positive");
    }

    if let Some(dir) = cfg.db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    let store = spawn_store(&cfg.db_path, Duration::from_secs(cfg.store_timeout_secs))?;

    // Bulk-load the gallery; a stored row with the wrong dimension is a
    // configuration error and stops the daemon here.
    let rows = store.load_visitors().await.context("loading visitor gallery")?;
    let gallery = Gallery::from_rows(
        cfg.embedding_dim,
        rows.into_iter().map(|r| (r.visitor, r.embedding)),
    )
    .context("gallery dimension check failed")?;
    tracing::info!(
        visitors = gallery.len(),
        dim = cfg.embedding_dim,
        threshold = cfg.similarity_threshold,
        debounce_secs = cfg.exit_debounce_seconds,
        "gallery loaded"
    );

    let resolver = IdentityResolver::new(Arc::new(Mutex::new(gallery)), cfg.similarity_threshold);
    let mut pipeline = Pipeline::new(resolver, cfg.pipeline_config());
    let mut logger = EventLogger::new(store);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_frame_at = tokio::time::Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tracing::info!("footfalld ready; reading frames from stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    last_frame_at = tokio::time::Instant::now();
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame = match ingest::parse_frame(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed frame");
                            continue;
                        }
                    };
                    // Dimension mismatches are fatal; everything else the
                    // pipeline absorbs.
                    let outcome = pipeline.process_frame(&frame).context("pipeline halted")?;
                    persist_outcome(&mut logger, outcome).await;
                }
                Ok(None) => {
                    tracing::info!("frame feed closed");
                    break;
                }
                Err(e) => return Err(e).context("reading frame feed"),
            },
            _ = tick.tick() => {
                // While frames are flowing, debounce timers settle on frame
                // timestamps inside process_frame; the wall clock only takes
                // over once the feed has gone quiet, and never runs behind
                // the frames already seen.
                if last_frame_at.elapsed() >= TICK_INTERVAL {
                    let now = match pipeline.latest_frame_timestamp() {
                        Some(ts) => ts.max(Utc::now()),
                        None => Utc::now(),
                    };
                    let events = pipeline.tick(now);
                    persist_events(&mut logger, events).await;
                }
                note_deferred(logger.flush().await);
            }
            _ = &mut ctrl_c => {
                // In-flight debounce timers are abandoned without exits; a
                // restart rediscovers anyone still present.
                tracing::info!("footfalld shutting down");
                break;
            }
        }
    }

    // Last chance for writes that were deferred on a busy database.
    note_deferred(logger.flush().await);

    Ok(())
}

/// Forward one frame's worth of decisions to storage. Visitor rows go
/// first so events never dangle; retryable failures stay queued inside the
/// logger.
async fn persist_outcome(logger: &mut EventLogger, outcome: FrameOutcome) {
    for nv in outcome.new_visitors {
        note_deferred(
            logger
                .record_new_visitor(nv.visitor, nv.embedding, nv.first_seen)
                .await,
        );
    }
    for (visitor, seen_at) in outcome.seen {
        note_deferred(logger.record_visitor_seen(visitor, seen_at).await);
    }
    persist_events(logger, outcome.events).await;
}

async fn persist_events(logger: &mut EventLogger, events: Vec<VisitEvent>) {
    for event in events {
        note_deferred(logger.record_event(event).await);
    }
}

fn note_deferred(result: Result<(), StoreError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "store write deferred; will retry");
    }
}
