//! Per-track lifecycle state.
//!
//! A track is the tracker's transient handle on one continuous sighting.
//! It buffers embedding samples while pending, resolves to a visitor once
//! enough samples are in, and then only refreshes presence until lost.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Embedding, TrackId, VisitorId};

/// Buffered samples are capped; past this the oldest sample is dropped.
const MAX_BUFFERED_SAMPLES: usize = 16;

/// Lifecycle phase of a tracked face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackPhase {
    /// Track just created; not enough observations to resolve yet.
    #[default]
    Pending,
    /// Resolved to a visitor who is currently considered inside.
    ConfirmedPresent,
    /// Exit emitted; the visitor is considered gone.
    ConfirmedAbsent,
    /// Terminal.
    Expired,
}

/// Policy for collapsing a track's buffered samples into one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepresentativeStrategy {
    /// Most recent sample as-is.
    Latest,
    /// Element-wise mean of the buffer; damps blur and profile-angle noise.
    #[default]
    Centroid,
    /// Sample with the highest detector confidence.
    HighestConfidence,
}

impl RepresentativeStrategy {
    pub fn representative(&self, samples: &[Sample]) -> Option<Embedding> {
        match self {
            RepresentativeStrategy::Latest => samples.last().map(|s| s.embedding.clone()),
            RepresentativeStrategy::Centroid => {
                Embedding::centroid(samples.iter().map(|s| &s.embedding))
            }
            RepresentativeStrategy::HighestConfidence => samples
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .map(|s| s.embedding.clone()),
        }
    }
}

impl FromStr for RepresentativeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(RepresentativeStrategy::Latest),
            "centroid" => Ok(RepresentativeStrategy::Centroid),
            "highest-confidence" => Ok(RepresentativeStrategy::HighestConfidence),
            other => Err(format!(
                "unknown representative strategy {other:?} (expected latest, centroid, or highest-confidence)"
            )),
        }
    }
}

/// One buffered observation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub embedding: Embedding,
    pub confidence: f32,
    pub observed_at: DateTime<Utc>,
}

/// State for one live track.
#[derive(Debug)]
pub struct Track {
    id: TrackId,
    phase: TrackPhase,
    samples: Vec<Sample>,
    visitor: Option<VisitorId>,
    last_seen: DateTime<Utc>,
    last_confidence: f32,
    last_crop: Option<String>,
}

impl Track {
    pub fn new(id: TrackId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            phase: TrackPhase::Pending,
            samples: Vec::new(),
            visitor: None,
            last_seen: now,
            last_confidence: 0.0,
            last_crop: None,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    pub fn visitor(&self) -> Option<VisitorId> {
        self.visitor
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn last_confidence(&self) -> f32 {
        self.last_confidence
    }

    pub fn last_crop(&self) -> Option<&str> {
        self.last_crop.as_deref()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record an observation. Samples are buffered only while pending;
    /// a confirmed track just refreshes presence.
    pub fn observe(&mut self, sample: Sample, crop_path: Option<String>) {
        self.last_seen = sample.observed_at;
        self.last_confidence = sample.confidence;
        if crop_path.is_some() {
            self.last_crop = crop_path;
        }
        if self.phase == TrackPhase::Pending {
            if self.samples.len() == MAX_BUFFERED_SAMPLES {
                self.samples.remove(0);
            }
            self.samples.push(sample);
        }
    }

    /// Whether the buffer is full enough for a first resolution attempt.
    /// `min_samples` is clamped to the buffer cap; the buffer can never
    /// hold more than that, so a larger ask would wait forever.
    pub fn ready_to_resolve(&self, min_samples: usize) -> bool {
        let needed = min_samples.clamp(1, MAX_BUFFERED_SAMPLES);
        self.phase == TrackPhase::Pending && self.samples.len() >= needed
    }

    /// Representative probe embedding for the buffered samples.
    pub fn representative(&self, strategy: RepresentativeStrategy) -> Option<Embedding> {
        strategy.representative(&self.samples)
    }

    /// Pending → ConfirmedPresent. The sample buffer has served its
    /// purpose and is dropped.
    pub fn confirm(&mut self, visitor: VisitorId) {
        debug_assert_eq!(self.phase, TrackPhase::Pending);
        self.phase = TrackPhase::ConfirmedPresent;
        self.visitor = Some(visitor);
        self.samples.clear();
    }

    /// ConfirmedPresent → ConfirmedAbsent, once the exit debounce elapses.
    pub fn mark_absent(&mut self) {
        debug_assert_eq!(self.phase, TrackPhase::ConfirmedPresent);
        self.phase = TrackPhase::ConfirmedAbsent;
    }

    /// Terminal transition.
    pub fn expire(&mut self) {
        self.phase = TrackPhase::Expired;
    }

    /// Whether this track has gone unobserved longer than `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_seen >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(values: Vec<f32>, confidence: f32) -> Sample {
        Sample {
            embedding: Embedding::new(values),
            confidence,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_pending_track_buffers_samples() {
        let mut t = Track::new(1, Utc::now());
        assert_eq!(t.phase(), TrackPhase::Pending);
        assert!(!t.ready_to_resolve(2));

        t.observe(sample(vec![1.0, 0.0], 0.9), None);
        assert!(!t.ready_to_resolve(2));
        t.observe(sample(vec![0.0, 1.0], 0.8), None);
        assert!(t.ready_to_resolve(2));
    }

    #[test]
    fn test_min_samples_zero_still_needs_one_observation() {
        let t = Track::new(1, Utc::now());
        assert!(!t.ready_to_resolve(0));
    }

    #[test]
    fn test_confirm_moves_to_present_and_drops_buffer() {
        let mut t = Track::new(1, Utc::now());
        t.observe(sample(vec![1.0, 0.0], 0.9), None);
        let visitor = VisitorId::new();
        t.confirm(visitor);

        assert_eq!(t.phase(), TrackPhase::ConfirmedPresent);
        assert_eq!(t.visitor(), Some(visitor));
        assert_eq!(t.sample_count(), 0);

        // Further observations refresh presence only.
        t.observe(sample(vec![0.5, 0.5], 0.7), Some("crop.jpg".into()));
        assert_eq!(t.sample_count(), 0);
        assert_eq!(t.last_crop(), Some("crop.jpg"));
        assert_eq!(t.last_confidence(), 0.7);
    }

    #[test]
    fn test_buffer_is_capped() {
        let mut t = Track::new(1, Utc::now());
        for i in 0..40 {
            t.observe(sample(vec![i as f32, 1.0], 0.5), None);
        }
        assert_eq!(t.sample_count(), MAX_BUFFERED_SAMPLES);
    }

    #[test]
    fn test_min_samples_beyond_buffer_cap_still_resolves() {
        let mut t = Track::new(1, Utc::now());
        for i in 0..MAX_BUFFERED_SAMPLES {
            assert!(!t.ready_to_resolve(usize::MAX), "not ready after {i} samples");
            t.observe(sample(vec![i as f32, 1.0], 0.5), None);
        }
        // A full buffer satisfies any configured minimum.
        assert!(t.ready_to_resolve(usize::MAX));
        assert!(t.ready_to_resolve(MAX_BUFFERED_SAMPLES + 1));
    }

    #[test]
    fn test_strategies_pick_expected_sample() {
        let samples = vec![
            sample(vec![1.0, 0.0], 0.4),
            sample(vec![0.0, 1.0], 0.9),
            sample(vec![1.0, 1.0], 0.6),
        ];

        let latest = RepresentativeStrategy::Latest.representative(&samples).unwrap();
        assert_eq!(latest.values, vec![1.0, 1.0]);

        let best = RepresentativeStrategy::HighestConfidence
            .representative(&samples)
            .unwrap();
        assert_eq!(best.values, vec![0.0, 1.0]);

        let centroid = RepresentativeStrategy::Centroid
            .representative(&samples)
            .unwrap();
        assert!((centroid.values[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((centroid.values[1] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_strategy_parses_config_values() {
        assert_eq!(
            "centroid".parse::<RepresentativeStrategy>().unwrap(),
            RepresentativeStrategy::Centroid
        );
        assert_eq!(
            "highest-confidence".parse::<RepresentativeStrategy>().unwrap(),
            RepresentativeStrategy::HighestConfidence
        );
        assert!("freshest".parse::<RepresentativeStrategy>().is_err());
    }

    #[test]
    fn test_staleness_uses_wall_clock() {
        let start = Utc::now();
        let t = Track::new(1, start);
        assert!(!t.is_stale(start + Duration::seconds(5), Duration::seconds(10)));
        assert!(t.is_stale(start + Duration::seconds(10), Duration::seconds(10)));
    }
}
