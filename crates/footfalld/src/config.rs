use std::path::PathBuf;

use chrono::Duration;
use footfall_core::{PipelineConfig, RepresentativeStrategy};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match, in (0, 1].
    pub similarity_threshold: f32,
    /// Seconds of continuous absence before an exit is real.
    pub exit_debounce_seconds: f64,
    /// Fixed embedding dimension for the gallery.
    pub embedding_dim: usize,
    /// Observations buffered before the first resolution attempt.
    pub min_samples: usize,
    /// How buffered samples collapse into one probe embedding.
    pub representative: RepresentativeStrategy,
    /// Tracks unobserved for this long are aged out as lost.
    pub track_timeout_seconds: f64,
    /// Timeout for each store call.
    pub store_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `FOOTFALL_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("footfall");

        let db_path = std::env::var("FOOTFALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("visits.db"));

        Self {
            db_path,
            similarity_threshold: env_f32("FOOTFALL_SIMILARITY_THRESHOLD", 0.6),
            exit_debounce_seconds: env_f64("FOOTFALL_EXIT_DEBOUNCE_SECONDS", 3.0),
            embedding_dim: env_usize("FOOTFALL_EMBEDDING_DIM", 512),
            min_samples: env_usize("FOOTFALL_MIN_SAMPLES", 1),
            representative: std::env::var("FOOTFALL_REPRESENTATIVE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            track_timeout_seconds: env_f64("FOOTFALL_TRACK_TIMEOUT_SECONDS", 10.0),
            store_timeout_secs: env_u64("FOOTFALL_STORE_TIMEOUT_SECS", 5),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            exit_debounce: Duration::milliseconds((self.exit_debounce_seconds * 1000.0) as i64),
            min_samples: self.min_samples,
            strategy: self.representative,
            track_timeout: Duration::milliseconds((self.track_timeout_seconds * 1000.0) as i64),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
